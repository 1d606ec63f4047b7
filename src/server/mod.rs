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

//! Server-side invokers.
//!
//! A [`SocketServerInvoker`] owns a listening socket and a bounded pool of
//! worker threads. The accept thread is the only thread that touches the
//! listener; each accepted connection is handed to a pooled worker, which
//! owns it until it closes or idles out. Worker threads outlive their
//! connections: a worker whose connection dies returns to the free list and
//! the next accepted connection reuses the same worker identity.
//!
//! Session liveness is tracked by the [`LeaseRegistry`]: clients that
//! requested leasing must renew with `$PING$` invocations, and sessions that
//! miss their window are torn down by a reaper thread.

mod invoker;
mod lease;
mod worker;

pub use invoker::{InvokerState, ServerMetrics, ServerMetricsSnapshot, SocketServerInvoker};
pub use lease::LeaseRegistry;
pub use worker::WorkerId;

pub(crate) use invoker::ServerCore;
