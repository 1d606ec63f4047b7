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

//! Client-side callback endpoint for the bisocket transport.

use crate::error::BackhaulError;
use crate::handler::InvokerCallbackHandler;
use crate::invocation::{
    InvocationRequest, InvocationResponse, ListenerId, Operation, SessionId, WireMessage,
};
use crate::locator::InvokerLocator;
use crate::marshal::{codec_for, Marshaller, UnMarshaller};
use crate::transport::{ConnectionFactory, PlainConnectionFactory, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How often the monitor re-checks the live-connection count even without a
/// reader death nudging it.
const REPLENISH_INTERVAL: Duration = Duration::from_millis(500);

/// Client-side counterpart of a bisocket server's control pool.
///
/// The endpoint proactively opens and holds `min_control_connections`
/// connections to the server's secondary port. Each is handed to a reader
/// thread that blocks until the server pushes an invocation through it,
/// delivers the callback to the registered handler, and writes the
/// acknowledgement. A consumed or dead connection is replaced by the
/// monitor thread, so the configured minimum stays available.
///
/// No local listening socket is ever created: every byte the server pushes
/// travels over a connection this endpoint originated.
pub struct CallbackEndpoint {
    locator: InvokerLocator,
    factory: Arc<dyn ConnectionFactory>,
    marshaller: Box<dyn Marshaller>,
    unmarshaller: Box<dyn UnMarshaller>,
    session_id: SessionId,
    secondary_port: u16,
    handlers: Mutex<HashMap<ListenerId, Arc<dyn InvokerCallbackHandler>>>,
    live: AtomicUsize,
    shutdown: AtomicBool,
    nudge: Sender<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    /// Clones of the reader streams, so `close()` can unblock readers
    /// parked in indefinite reads.
    reader_streams: Mutex<Vec<TcpStream>>,
}

impl CallbackEndpoint {
    /// Opens the endpoint: dials the initial control connections and starts
    /// the replenishment monitor.
    ///
    /// # Errors
    ///
    /// Fails only if the *first* control connection cannot be opened; later
    /// losses are repaired by the monitor.
    pub fn start(
        locator: InvokerLocator,
        session_id: SessionId,
        secondary_port: u16,
    ) -> Result<Arc<Self>, BackhaulError> {
        let (marshaller, unmarshaller) = codec_for(&locator);
        let (nudge, nudge_rx) = unbounded();
        let endpoint = Arc::new(Self {
            factory: Arc::new(PlainConnectionFactory),
            marshaller,
            unmarshaller,
            session_id,
            secondary_port,
            handlers: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            nudge,
            monitor: Mutex::new(None),
            reader_streams: Mutex::new(Vec::new()),
            locator,
        });

        // Prove connectivity synchronously; the monitor sustains it.
        Self::open_control(&endpoint)?;
        let monitor_endpoint = endpoint.clone();
        let monitor = thread::Builder::new()
            .name("backhaul-control-monitor".to_string())
            .spawn(move || monitor_endpoint.monitor_loop(nudge_rx))
            .map_err(TransportError::from)?;
        *endpoint.monitor.lock() = Some(monitor);
        Ok(endpoint)
    }

    /// The session these control connections belong to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of currently live control connections.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Routes pushed callbacks for `listener_id` to `handler`.
    pub fn register_handler(
        &self,
        listener_id: ListenerId,
        handler: Arc<dyn InvokerCallbackHandler>,
    ) {
        self.handlers.lock().insert(listener_id, handler);
    }

    /// Stops routing callbacks for `listener_id`.
    pub fn unregister_handler(&self, listener_id: ListenerId) {
        self.handlers.lock().remove(&listener_id);
    }

    /// Shuts the endpoint down: stops replenishment and closes every
    /// control connection, unblocking parked readers.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.nudge.send(());
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
        for stream in self.reader_streams.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn monitor_loop(self: Arc<Self>, nudge_rx: Receiver<()>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            while self.live.load(Ordering::SeqCst) < self.locator.min_control_connections()
                && !self.shutdown.load(Ordering::SeqCst)
            {
                if let Err(error) = Self::open_control(&self) {
                    debug!(%error, "control replenishment failed, retrying");
                    break;
                }
            }
            // Park until a reader dies or the interval elapses.
            let _ = nudge_rx.recv_timeout(REPLENISH_INTERVAL);
        }
        trace!("control monitor exited");
    }

    /// Opens one control connection: dial, handshake, hand to a reader.
    fn open_control(endpoint: &Arc<Self>) -> Result<(), BackhaulError> {
        let timeout = endpoint.locator.timeout();
        let mut stream = endpoint
            .factory
            .connect(endpoint.locator.connect_host(), endpoint.secondary_port, timeout)
            .map_err(|e| TransportError::from_io(e, timeout))?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::from)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(TransportError::from)?;

        let handshake = InvocationRequest {
            session_id: endpoint.session_id.clone(),
            subsystem: String::new(),
            operation: Operation::RegisterControl,
        };
        endpoint
            .marshaller
            .write_message(&WireMessage::Request(handshake), &mut stream)?;
        match endpoint.unmarshaller.read_message(&mut stream)? {
            WireMessage::Response(_) => {}
            WireMessage::Request(_) => {
                return Err(BackhaulError::Transport(TransportError::ConnectionLost {
                    reason: "control handshake answered with a request frame".to_string(),
                    source: None,
                }))
            }
        }

        // Pushed invocations arrive whenever the server has something to
        // say; the reader must block indefinitely, not time out.
        stream
            .set_read_timeout(None)
            .map_err(TransportError::from)?;
        endpoint
            .reader_streams
            .lock()
            .push(stream.try_clone().map_err(TransportError::from)?);

        endpoint.live.fetch_add(1, Ordering::SeqCst);
        let reader_endpoint = endpoint.clone();
        thread::Builder::new()
            .name("backhaul-control-reader".to_string())
            .spawn(move || reader_endpoint.reader_loop(stream))
            .map_err(TransportError::from)?;
        trace!(live = endpoint.live_connections(), "control connection opened");
        Ok(())
    }

    /// Serves pushed invocations on one control connection until it dies.
    fn reader_loop(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let message = match self.unmarshaller.read_message(&mut stream) {
                Ok(message) => message,
                Err(error) => {
                    if !self.shutdown.load(Ordering::SeqCst) {
                        debug!(%error, "control connection lost");
                    }
                    break;
                }
            };
            let request = match message {
                WireMessage::Request(request) => request,
                WireMessage::Response(_) => {
                    warn!("unexpected response frame on control connection");
                    break;
                }
            };

            let response = self.handle_push(&request);
            if let Err(error) = self
                .marshaller
                .write_message(&WireMessage::Response(response), &mut stream)
            {
                debug!(%error, "failed to acknowledge pushed callback");
                break;
            }
        }

        let _ = stream.shutdown(Shutdown::Both);
        self.live.fetch_sub(1, Ordering::SeqCst);
        // Wake the monitor so replenishment is proactive rather than
        // waiting out the interval.
        let _ = self.nudge.send(());
    }

    fn handle_push(&self, request: &InvocationRequest) -> InvocationResponse {
        let Operation::DeliverCallback { callback } = &request.operation else {
            return InvocationResponse::fault("control connections only carry deliveries");
        };
        let listener_id = match callback.metadata {
            Some(metadata) => metadata.listener_id,
            None => return InvocationResponse::fault("delivery without listener metadata"),
        };
        let handler = self.handlers.lock().get(&listener_id).cloned();
        match handler {
            Some(handler) => match handler.handle_callback(callback.clone()) {
                Ok(()) => InvocationResponse::ack(),
                Err(error) => InvocationResponse::fault(error.to_string()),
            },
            None => InvocationResponse::fault(format!("no handler for {listener_id}")),
        }
    }
}
