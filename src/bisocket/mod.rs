//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! The bisocket transport: server push through client-originated
//! connections.
//!
//! Plain sockets need the server to reach the client to push callbacks;
//! clients behind NAT or a firewall can only *originate* connections. A
//! [`BisocketServerInvoker`] treats a pool of client-originated "control
//! connections" as a virtual listening socket: when the server needs to push
//! an invocation, it withdraws a control connection from the session's
//! [`ControlPool`], performs the exchange exactly as a worker would on an
//! accepted connection, and restores the connection for reuse.
//!
//! The client side runs a [`CallbackEndpoint`]: it opens and holds the
//! control connections, reads pushed invocations off them, and proactively
//! replenishes the pool whenever a connection is consumed or dies, keeping
//! the configured minimum available at all times. A callback endpoint never
//! creates a local listening socket.

mod control;
mod endpoint;
mod server;

pub use control::{ControlPool, ControlPools, ControlSink};
pub use endpoint::CallbackEndpoint;
pub use server::BisocketServerInvoker;
