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

//! The socket client invoker.

use crate::error::BackhaulError;
use crate::invocation::{
    InvocationRequest, InvocationResponse, LeaseRequest, Operation, SessionId, WireMessage,
    PING_SUBSYSTEM,
};
use crate::locator::InvokerLocator;
use crate::marshal::{codec_for, MarshalError, Marshaller, UnMarshaller};
use crate::pool::{LruPool, OverflowPolicy};
use crate::transport::{ConnectionFactory, ConnectionId, PlainConnectionFactory, TransportError};
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// One reusable client connection.
struct PooledConnection {
    id: ConnectionId,
    stream: TcpStream,
}

/// How one invocation attempt failed.
enum AttemptError {
    /// Worth retrying on a fresh connection if attempts remain.
    Retry(TransportError),
    /// Not a connection problem; retrying cannot help.
    Fatal(BackhaulError),
}

/// Client-side owner of the connections to one server endpoint.
///
/// Connections are pooled with LRU eviction up to `clientMaxPoolSize` and
/// reused across invocations. Each invocation blocks its calling thread:
/// check a connection out (or establish one), write the framed request,
/// block for the framed response under the per-invocation timeout, check
/// the connection back in. A connection that fails mid-exchange is
/// discarded, never repooled.
///
/// Establishment and exchange failures are retried on fresh connections up
/// to `numberOfCallAttempts`, each attempt with the full timeout; exhaustion
/// surfaces the distinct [`TransportError::CannotConnect`] condition.
/// Interruption is surfaced as [`TransportError::Interrupted`] immediately,
/// never folded into the retry loop.
pub struct SocketClientInvoker {
    locator: InvokerLocator,
    factory: Arc<dyn ConnectionFactory>,
    marshaller: Box<dyn Marshaller>,
    unmarshaller: Box<dyn UnMarshaller>,
    pool: LruPool<ConnectionId, PooledConnection>,
    session_id: SessionId,
    timeout: Duration,
    attempts: u32,
    closed: AtomicBool,
}

impl SocketClientInvoker {
    /// Creates an invoker for `locator` with the plain TCP factory.
    #[must_use]
    pub fn new(locator: InvokerLocator) -> Self {
        Self::with_factory(locator, Arc::new(PlainConnectionFactory))
    }

    /// Creates an invoker with an alternative [`ConnectionFactory`].
    #[must_use]
    pub fn with_factory(locator: InvokerLocator, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (marshaller, unmarshaller) = codec_for(&locator);
        Self {
            pool: LruPool::new(locator.client_max_pool_size(), OverflowPolicy::Evict),
            session_id: SessionId::generate(),
            timeout: locator.timeout(),
            attempts: locator.number_of_call_attempts(),
            closed: AtomicBool::new(false),
            locator,
            factory,
            marshaller,
            unmarshaller,
        }
    }

    /// The endpoint this invoker talks to.
    pub fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    /// The session identity sent with every request.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The per-invocation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of connections currently pooled.
    pub fn pooled_connections(&self) -> usize {
        self.pool.size()
    }

    /// Performs one blocking invocation with the configured timeout and
    /// attempt count.
    ///
    /// # Errors
    ///
    /// A [`TransportError::CannotConnect`] after exhausting attempts, a
    /// typed timeout/interruption, or a [`BackhaulError::Marshal`] for
    /// codec failures.
    pub fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse, BackhaulError> {
        self.invoke_attempts(&request, self.timeout, self.attempts)
            .map(|response| response.expect("two-way invocation always has a response"))
    }

    /// Performs one blocking invocation with an explicit timeout and a
    /// single attempt.
    ///
    /// Used by liveness probes, which own their deadline and must not
    /// inherit the caller-facing retry policy.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke), without retries.
    pub fn invoke_once(
        &self,
        request: InvocationRequest,
        timeout: Duration,
    ) -> Result<InvocationResponse, BackhaulError> {
        self.invoke_attempts(&request, timeout, 1)
            .map(|response| response.expect("two-way invocation always has a response"))
    }

    /// Writes a fire-and-forget invocation without awaiting a response.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke); only the write is covered by the
    /// timeout.
    pub fn invoke_oneway(&self, request: InvocationRequest) -> Result<(), BackhaulError> {
        debug_assert!(!request.operation.expects_response());
        self.invoke_attempts(&request, self.timeout, self.attempts)
            .map(|_| ())
    }

    /// Sends a `$PING$` probe.
    ///
    /// With `lease` terms this renews the server-side session lease; bare
    /// pings only prove the server is answering.
    ///
    /// # Errors
    ///
    /// As [`invoke_once`](Self::invoke_once).
    pub fn ping(
        &self,
        lease: Option<LeaseRequest>,
        timeout: Duration,
    ) -> Result<(), BackhaulError> {
        let request = InvocationRequest {
            session_id: self.session_id.clone(),
            subsystem: PING_SUBSYSTEM.to_string(),
            operation: Operation::Ping { lease },
        };
        self.invoke_once(request, timeout).map(|_| ())
    }

    /// Drops every pooled connection and rejects further invocations.
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pool.close();
        for (_, connection) in self.pool.drain() {
            trace!(connection = %connection.id, "dropping pooled connection");
        }
        debug!(locator = %self.locator, "client invoker disconnected");
    }

    fn invoke_attempts(
        &self,
        request: &InvocationRequest,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Option<InvocationResponse>, BackhaulError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }

        let mut last_error: Option<TransportError> = None;
        for attempt in 1..=attempts {
            let mut connection = match self.checkout(timeout) {
                Ok(connection) => connection,
                Err(error) => {
                    if error.is_interrupted() {
                        return Err(error.into());
                    }
                    debug!(attempt, %error, "connection attempt failed");
                    last_error = Some(error);
                    continue;
                }
            };

            match self.exchange(&mut connection, request, timeout) {
                Ok(response) => {
                    self.checkin(connection);
                    return Ok(response);
                }
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retry(error)) => {
                    // The connection is suspect; drop it rather than repool.
                    if error.is_interrupted() {
                        return Err(error.into());
                    }
                    debug!(attempt, %error, "invocation attempt failed");
                    last_error = Some(error);
                }
            }
        }

        let address = format!("{}:{}", self.locator.connect_host(), self.locator.port());
        let source = match last_error {
            Some(TransportError::Io { source }) => source,
            Some(other) => io::Error::new(io::ErrorKind::Other, other.to_string()),
            None => io::Error::new(io::ErrorKind::Other, "no attempt was made"),
        };
        Err(TransportError::CannotConnect {
            address,
            attempts,
            source,
        }
        .into())
    }

    fn checkout(&self, timeout: Duration) -> Result<PooledConnection, TransportError> {
        if let Some((_, connection)) = self.pool.take_mru() {
            trace!(connection = %connection.id, "reusing pooled connection");
            return Ok(connection);
        }
        let stream = self
            .factory
            .connect(self.locator.connect_host(), self.locator.port(), timeout)
            .map_err(|error| TransportError::from_io(error, timeout))?;
        let connection = PooledConnection {
            id: ConnectionId::next(),
            stream,
        };
        trace!(connection = %connection.id, "established connection");
        Ok(connection)
    }

    fn checkin(&self, connection: PooledConnection) {
        match self.pool.insert(connection.id, connection) {
            Ok(Some((evicted_id, _))) => {
                trace!(connection = %evicted_id, "evicted least-recently-used connection");
            }
            Ok(None) => {}
            Err(_) => {
                // Pool closed mid-flight; the connection just drops.
            }
        }
    }

    fn exchange(
        &self,
        connection: &mut PooledConnection,
        request: &InvocationRequest,
        timeout: Duration,
    ) -> Result<Option<InvocationResponse>, AttemptError> {
        let stream = &mut connection.stream;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| AttemptError::Retry(TransportError::from(e)))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| AttemptError::Retry(TransportError::from(e)))?;

        self.marshaller
            .write_message(&WireMessage::Request(request.clone()), stream)
            .map_err(|error| classify_marshal(error, timeout))?;

        if !request.operation.expects_response() {
            return Ok(None);
        }

        match self.unmarshaller.read_message(stream) {
            Ok(WireMessage::Response(response)) => Ok(Some(response)),
            Ok(WireMessage::Request(_)) => {
                Err(AttemptError::Retry(TransportError::ConnectionLost {
                    reason: "peer sent a request frame in place of a response".to_string(),
                    source: None,
                }))
            }
            Err(error) => Err(classify_marshal(error, timeout)),
        }
    }
}

/// Splits codec failures into connection problems (retryable) and data
/// problems (fatal).
fn classify_marshal(error: MarshalError, timeout: Duration) -> AttemptError {
    match error {
        MarshalError::Io { source } => {
            AttemptError::Retry(TransportError::from_io(source, timeout))
        }
        MarshalError::Decode { reason } => {
            // The stream is out of sync; the connection is unusable but a
            // fresh one may succeed.
            AttemptError::Retry(TransportError::ConnectionLost {
                reason: format!("undecodable response: {reason}"),
                source: None,
            })
        }
        other => AttemptError::Fatal(other.into()),
    }
}

impl Drop for SocketClientInvoker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{Payload, ResponseBody};
    use crate::marshal::JsonMarshaller;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    fn request(payload: Payload) -> InvocationRequest {
        InvocationRequest {
            session_id: SessionId::generate(),
            subsystem: "echo".to_string(),
            operation: Operation::Call { payload },
        }
    }

    /// Minimal single-threaded echo server answering `count` invocations.
    fn echo_server(count: usize) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let codec = JsonMarshaller;
            let mut served = 0;
            while served < count {
                let (mut stream, _) = listener.accept().unwrap();
                loop {
                    match codec.read_message(&mut stream) {
                        Ok(WireMessage::Request(request)) => {
                            let payload =
                                request.operation.payload().cloned().unwrap_or(Payload::Null);
                            let response = InvocationResponse::value(payload);
                            if codec
                                .write_message(&WireMessage::Response(response), &mut stream)
                                .is_err()
                            {
                                break;
                            }
                            served += 1;
                            if served == count {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            }
        });
        (addr, handle)
    }

    fn invoker_for(addr: std::net::SocketAddr, query: &str) -> SocketClientInvoker {
        let locator = InvokerLocator::parse(&format!(
            "socket://127.0.0.1:{}/?{}",
            addr.port(),
            query
        ))
        .unwrap();
        SocketClientInvoker::new(locator)
    }

    #[test]
    fn test_invoke_and_connection_reuse() {
        let (addr, server) = echo_server(2);
        let invoker = invoker_for(addr, "timeout=2000");

        for i in 0..2 {
            let response = invoker.invoke(request(Payload::from(i))).unwrap();
            assert_eq!(response.body, ResponseBody::Value(Payload::from(i)));
        }
        // Both invocations rode one pooled connection.
        assert_eq!(invoker.pooled_connections(), 1);
        server.join().unwrap();
    }

    #[test]
    fn test_single_attempt_failure_is_cannot_connect() {
        // Nothing listening on this port.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let invoker = invoker_for(addr, "timeout=300&numberOfCallAttempts=1");

        let started = Instant::now();
        let error = invoker.invoke(request(Payload::Null)).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match error {
            BackhaulError::Transport(transport) => {
                assert!(transport.is_cannot_connect());
            }
            other => panic!("expected a transport error, got {other}"),
        }
    }

    #[test]
    fn test_stalled_server_times_out_into_cannot_connect() {
        // A server that accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _keep = thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept() {
                held.push(stream);
            }
        });

        let invoker = invoker_for(addr, "timeout=300&numberOfCallAttempts=1");
        let started = Instant::now();
        let error = invoker.invoke(request(Payload::Null)).unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(280), "returned too early: {elapsed:?}");
        match error {
            BackhaulError::Transport(transport) => assert!(transport.is_cannot_connect()),
            other => panic!("expected a transport error, got {other}"),
        }
    }

    #[test]
    fn test_second_attempt_succeeds_after_first_stalls() {
        // First connection is accepted and ignored; the second is served.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let codec = JsonMarshaller;
            let (_stalled, _) = listener.accept().unwrap();
            let (mut stream, _) = listener.accept().unwrap();
            if let Ok(WireMessage::Request(request)) = codec.read_message(&mut stream) {
                let payload = request.operation.payload().cloned().unwrap_or(Payload::Null);
                let _ = codec.write_message(
                    &WireMessage::Response(InvocationResponse::value(payload)),
                    &mut stream,
                );
            }
        });

        let invoker = invoker_for(addr, "timeout=500&numberOfCallAttempts=2");
        let started = Instant::now();
        let response = invoker.invoke(request(Payload::from("retry me"))).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(
            response.body,
            ResponseBody::Value(Payload::from("retry me"))
        );
        // First attempt burned its full timeout before the retry succeeded.
        assert!(elapsed >= Duration::from_millis(480), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_000), "{elapsed:?}");
    }

    #[test]
    fn test_fifth_attempt_succeeds_with_cumulative_delay() {
        // Four stalled connections, then service.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let codec = JsonMarshaller;
            let mut stalled = Vec::new();
            for _ in 0..4 {
                stalled.push(listener.accept().unwrap());
            }
            let (mut stream, _) = listener.accept().unwrap();
            if let Ok(WireMessage::Request(request)) = codec.read_message(&mut stream) {
                let payload = request.operation.payload().cloned().unwrap_or(Payload::Null);
                let _ = codec.write_message(
                    &WireMessage::Response(InvocationResponse::value(payload)),
                    &mut stream,
                );
            }
        });

        let invoker = invoker_for(addr, "timeout=200&numberOfCallAttempts=5");
        let started = Instant::now();
        let response = invoker.invoke(request(Payload::from(5))).unwrap();
        assert_eq!(response.body, ResponseBody::Value(Payload::from(5)));
        // Four failed attempts of ~200ms each precede the success.
        assert!(started.elapsed() >= Duration::from_millis(4 * 180));
    }

    #[test]
    fn test_disconnected_invoker_rejects_invocations() {
        let (addr, server) = echo_server(1);
        let invoker = invoker_for(addr, "timeout=2000");
        invoker.invoke(request(Payload::Null)).unwrap();
        server.join().unwrap();

        invoker.disconnect();
        assert!(matches!(
            invoker.invoke(request(Payload::Null)),
            Err(BackhaulError::Transport(TransportError::Closed))
        ));
        assert_eq!(invoker.pooled_connections(), 0);
    }

    #[test]
    fn test_pool_evicts_least_recently_used_connection() {
        // Server keeps every connection open; client cap of 2.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let codec = JsonMarshaller;
            let mut threads = Vec::new();
            while let Ok((mut stream, _)) = listener.accept() {
                threads.push(thread::spawn(move || loop {
                    match codec.read_message(&mut stream) {
                        Ok(WireMessage::Request(request)) => {
                            let payload =
                                request.operation.payload().cloned().unwrap_or(Payload::Null);
                            if codec
                                .write_message(
                                    &WireMessage::Response(InvocationResponse::value(payload)),
                                    &mut stream,
                                )
                                .is_err()
                            {
                                break;
                            }
                        }
                        _ => break,
                    }
                }));
            }
        });

        let invoker = invoker_for(addr, "timeout=2000&clientMaxPoolSize=2");
        // Three interleaved "sessions" can only keep two connections pooled.
        // Simulate by checking out connections concurrently.
        let invoker = Arc::new(invoker);
        let mut handles = Vec::new();
        for i in 0..3 {
            let invoker = invoker.clone();
            handles.push(thread::spawn(move || {
                invoker.invoke(request(Payload::from(i))).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(invoker.pooled_connections() <= 2);
    }
}
