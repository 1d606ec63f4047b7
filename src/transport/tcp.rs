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

//! Plain TCP connection factory.

use crate::transport::ConnectionFactory;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::trace;

/// The default [`ConnectionFactory`], producing unencrypted TCP streams.
///
/// `TCP_NODELAY` is set on outbound streams: invocations are small framed
/// request/response pairs, and Nagle delays cost a full round trip on every
/// exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainConnectionFactory;

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{host}:{port} did not resolve")))
}

impl ConnectionFactory for PlainConnectionFactory {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
        let address = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&address, timeout)?;
        stream.set_nodelay(true)?;
        trace!(%address, "opened outbound connection");
        Ok(stream)
    }

    fn bind(&self, host: &str, port: u16, backlog: u32) -> io::Result<TcpListener> {
        let address = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(backlog as i32)?;
        trace!(%address, backlog, "bound listening socket");
        Ok(socket.into())
    }
}

/// Probes a stream for a dead or half-closed peer without consuming
/// application bytes.
///
/// Used by workers in `check_connection` mode after each response, before
/// committing to the next blocking read. The stream is briefly switched to
/// non-blocking for a one-byte peek: pending data or `WouldBlock` mean the
/// peer is still there; a zero-byte peek is the peer's orderly shutdown, and
/// any other error is a broken connection.
pub fn peer_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    if stream.set_nonblocking(false).is_err() {
        return false;
    }
    alive
}
