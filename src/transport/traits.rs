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

use std::io;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Produces the physical streams and listeners an invoker runs on.
///
/// Invokers are parameterized by a factory instead of subclassing per
/// transport flavor: plain TCP, SSL-wrapped sockets, and test doubles are
/// all alternative implementations behind this one seam. Construction of
/// SSL contexts themselves is outside the runtime; an SSL factory arrives
/// already configured.
///
/// Factories return raw `io::Result`s; classification into the
/// [`TransportError`](crate::transport::TransportError) taxonomy (including
/// retry accounting for the cannot-connect condition) is the caller's job.
pub trait ConnectionFactory: Send + Sync {
    /// Opens a stream to `host:port`, bounded by `timeout`.
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream>;

    /// Binds a listener on `host:port` with the given accept backlog.
    fn bind(&self, host: &str, port: u16, backlog: u32) -> io::Result<TcpListener>;
}
