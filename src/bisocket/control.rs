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

//! Server-side pools of client-originated control connections.

use crate::callback::{CallbackError, CallbackSink};
use crate::invocation::{
    InvocationRequest, InvocationResponse, ListenerId, Operation, ResponseBody, SessionId,
    WireMessage,
};
use crate::marshal::{Marshaller, UnMarshaller};
use crate::transport::TransportError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

struct ControlInner {
    connections: VecDeque<TcpStream>,
    closed: bool,
}

/// One client session's pool of control connections.
///
/// The server withdraws a connection to push an invocation and restores it
/// when the exchange completes; a connection that fails mid-push is simply
/// dropped, and the client's proactive replenishment covers the loss.
pub struct ControlPool {
    session: SessionId,
    inner: Mutex<ControlInner>,
    available: Condvar,
}

impl ControlPool {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            inner: Mutex::new(ControlInner {
                connections: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Adds a connection to the pool, fresh from the secondary acceptor or
    /// returned after a completed push.
    pub fn restore(&self, stream: TcpStream) {
        let mut inner = self.inner.lock();
        if inner.closed {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        inner.connections.push_back(stream);
        self.available.notify_one();
        trace!(session = %self.session, pooled = inner.connections.len(), "control connection pooled");
    }

    /// Withdraws a connection for one push exchange, blocking up to
    /// `timeout` while the pool is empty.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if no connection becomes available in
    /// time; [`TransportError::Closed`] if the pool closes while waiting.
    pub fn withdraw(&self, timeout: Duration) -> Result<TcpStream, TransportError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(TransportError::Closed);
            }
            if let Some(stream) = inner.connections.pop_front() {
                return Ok(stream);
            }
            if self.available.wait_for(&mut inner, timeout).timed_out()
                && inner.connections.is_empty()
            {
                return Err(TransportError::Timeout { duration: timeout });
            }
        }
    }

    /// Disposes of a withdrawn connection that failed its exchange instead
    /// of restoring it. The client's replenishment covers the loss.
    pub fn discard(&self, stream: TcpStream) {
        let _ = stream.shutdown(Shutdown::Both);
        trace!(session = %self.session, "control connection discarded");
    }

    /// Number of connections currently pooled.
    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Whether the pool currently holds no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the pool, shutting down every pooled connection and waking
    /// blocked withdrawers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for stream in inner.connections.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.available.notify_all();
    }
}

/// All control pools of one bisocket server, keyed by client session.
#[derive(Default)]
pub struct ControlPools {
    pools: Mutex<HashMap<SessionId, Arc<ControlPool>>>,
}

impl ControlPools {
    /// Creates an empty registry of pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a control connection for `session`, creating the session's
    /// pool on first contact.
    pub fn register(&self, session: SessionId, stream: TcpStream) {
        let pool = self
            .pools
            .lock()
            .entry(session.clone())
            .or_insert_with(|| Arc::new(ControlPool::new(session)))
            .clone();
        pool.restore(stream);
    }

    /// The pool for `session`, if any control connection ever arrived.
    pub fn pool(&self, session: &SessionId) -> Option<Arc<ControlPool>> {
        self.pools.lock().get(session).cloned()
    }

    /// Closes and removes one session's pool.
    pub fn remove_session(&self, session: &SessionId) {
        if let Some(pool) = self.pools.lock().remove(session) {
            debug!(%session, "closing control pool");
            pool.close();
        }
    }

    /// Number of sessions with a registered pool.
    pub fn session_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Closes every pool.
    pub fn close_all(&self) {
        for (_, pool) in self.pools.lock().drain() {
            pool.close();
        }
    }
}

/// Pushes callbacks over a session's control connections.
///
/// The exchange mirrors a normal worker exchange with the roles reversed:
/// the server writes the framed invocation and blocks for the framed
/// acknowledgement. A connection that completes its exchange is restored to
/// the pool; one that fails is discarded, relying on the client to
/// replenish.
pub struct ControlSink {
    pools: Arc<ControlPools>,
    session: SessionId,
    marshaller: Box<dyn Marshaller>,
    unmarshaller: Box<dyn UnMarshaller>,
    timeout: Duration,
}

impl ControlSink {
    /// Creates a sink pushing to `session` over `pools`.
    pub fn new(
        pools: Arc<ControlPools>,
        session: SessionId,
        marshaller: Box<dyn Marshaller>,
        unmarshaller: Box<dyn UnMarshaller>,
        timeout: Duration,
    ) -> Self {
        Self {
            pools,
            session,
            marshaller,
            unmarshaller,
            timeout,
        }
    }

    fn listener_of(request: &InvocationRequest) -> ListenerId {
        match &request.operation {
            Operation::DeliverCallback { callback } => callback
                .metadata
                .map(|metadata| metadata.listener_id)
                .unwrap_or_else(|| ListenerId::from(0)),
            _ => ListenerId::from(0),
        }
    }

    fn failed(&self, request: &InvocationRequest, reason: impl Into<String>) -> CallbackError {
        CallbackError::DeliveryFailed {
            listener_id: Self::listener_of(request),
            reason: reason.into(),
        }
    }
}

impl CallbackSink for ControlSink {
    fn deliver(&self, request: &InvocationRequest) -> Result<(), CallbackError> {
        let pool = self
            .pools
            .pool(&self.session)
            .ok_or_else(|| self.failed(request, "client holds no control connections"))?;
        let mut stream = pool
            .withdraw(self.timeout)
            .map_err(|error| self.failed(request, error.to_string()))?;

        let exchange = || -> Result<InvocationResponse, String> {
            stream
                .set_read_timeout(Some(self.timeout))
                .map_err(|e| e.to_string())?;
            stream
                .set_write_timeout(Some(self.timeout))
                .map_err(|e| e.to_string())?;
            self.marshaller
                .write_message(&WireMessage::Request(request.clone()), &mut stream)
                .map_err(|e| e.to_string())?;
            match self.unmarshaller.read_message(&mut stream) {
                Ok(WireMessage::Response(response)) => Ok(response),
                Ok(WireMessage::Request(_)) => Err("unexpected request frame".to_string()),
                Err(error) => Err(error.to_string()),
            }
        };

        match exchange() {
            Ok(response) => match response.body {
                ResponseBody::Ack | ResponseBody::Value(_) => {
                    pool.restore(stream);
                    Ok(())
                }
                ResponseBody::Fault(message) => {
                    // The client received and refused the callback; the
                    // channel itself is healthy.
                    pool.restore(stream);
                    Err(self.failed(request, message))
                }
                other => {
                    pool.discard(stream);
                    Err(self.failed(request, format!("unexpected response {other:?}")))
                }
            },
            Err(reason) => {
                warn!(session = %self.session, %reason, "control push failed, discarding connection");
                pool.discard(stream);
                Err(self.failed(request, reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_withdraw_blocks_until_restore() {
        let pool = Arc::new(ControlPool::new(SessionId::generate()));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.withdraw(Duration::from_secs(2)))
        };

        thread::sleep(Duration::from_millis(50));
        let (stream, _held) = stream_pair();
        pool.restore(stream);
        assert!(waiter.join().unwrap().is_ok());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_withdraw_times_out_when_empty() {
        let pool = ControlPool::new(SessionId::generate());
        match pool.withdraw(Duration::from_millis(80)) {
            Err(TransportError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_close_wakes_withdrawers() {
        let pool = Arc::new(ControlPool::new(SessionId::generate()));
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.withdraw(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_session_pools_are_isolated() {
        let pools = ControlPools::new();
        let session_a = SessionId::generate();
        let session_b = SessionId::generate();

        let (stream, _held) = stream_pair();
        pools.register(session_a.clone(), stream);
        assert_eq!(pools.session_count(), 1);
        assert!(pools.pool(&session_a).is_some());
        assert!(pools.pool(&session_b).is_none());

        pools.remove_session(&session_a);
        assert_eq!(pools.session_count(), 0);
    }
}
