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

//! The bisocket server invoker.

use crate::bisocket::ControlPools;
use crate::error::BackhaulError;
use crate::handler::{ConnectionListener, ServerInvocationHandler};
use crate::invocation::{InvocationResponse, Operation, WireMessage};
use crate::locator::InvokerLocator;
use crate::server::{
    InvokerState, LeaseRegistry, ServerCore, ServerMetricsSnapshot, SocketServerInvoker,
};
use crate::transport::{ConnectionFactory, PlainConnectionFactory, TransportError};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Poll interval for the secondary accept loop's shutdown check.
const SECONDARY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A server invoker whose push channel is a pool of client-originated
/// control connections.
///
/// This is a specialization of [`SocketServerInvoker`] by composition, not
/// reimplementation: the primary listener, worker pools, dispatch, and
/// lease machinery are the plain socket invoker's; the bisocket variant
/// adds a *secondary* listener that accepts control connections, binds each
/// to its session via a handshake frame, and feeds the per-session
/// [`ControlPools`] that push-mode callback dispatchers draw from.
pub struct BisocketServerInvoker {
    inner: SocketServerInvoker,
    control: Arc<ControlPools>,
    secondary_running: Arc<AtomicBool>,
    secondary_thread: Mutex<Option<JoinHandle<()>>>,
    secondary_addr: Mutex<Option<SocketAddr>>,
}

impl BisocketServerInvoker {
    /// Creates a bisocket invoker for `locator` with the plain TCP factory.
    #[must_use]
    pub fn new(locator: InvokerLocator) -> Self {
        Self::with_factory(locator, Arc::new(PlainConnectionFactory))
    }

    /// Creates a bisocket invoker with an alternative factory.
    #[must_use]
    pub fn with_factory(locator: InvokerLocator, factory: Arc<dyn ConnectionFactory>) -> Self {
        let control = Arc::new(ControlPools::new());
        let core = ServerCore::new(locator, factory, Some(control.clone()));
        Self {
            inner: SocketServerInvoker::from_core(core),
            control,
            secondary_running: Arc::new(AtomicBool::new(false)),
            secondary_thread: Mutex::new(None),
            secondary_addr: Mutex::new(None),
        }
    }

    /// The invoker's locator.
    pub fn locator(&self) -> &InvokerLocator {
        self.inner.locator()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InvokerState {
        self.inner.state()
    }

    /// The primary (invocation) address actually bound.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.bound_addr()
    }

    /// The secondary (control) address actually bound.
    pub fn secondary_addr(&self) -> Option<SocketAddr> {
        *self.secondary_addr.lock()
    }

    /// Point-in-time metrics of the underlying socket invoker.
    pub fn metrics(&self) -> ServerMetricsSnapshot {
        self.inner.metrics()
    }

    /// The server-side lease registry.
    pub fn leases(&self) -> &LeaseRegistry {
        self.inner.leases()
    }

    /// The per-session control pools.
    pub fn control_pools(&self) -> &Arc<ControlPools> {
        &self.control
    }

    /// Registers the handler for a named subsystem.
    ///
    /// # Errors
    ///
    /// See [`SocketServerInvoker::register_handler`].
    pub fn register_handler(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Result<(), BackhaulError> {
        self.inner.register_handler(subsystem, handler)
    }

    /// Removes a subsystem handler.
    pub fn unregister_handler(&self, subsystem: &str) {
        self.inner.unregister_handler(subsystem)
    }

    /// Registers an observer for expired client sessions.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.add_connection_listener(listener)
    }

    /// Starts the primary invoker, then binds the secondary listener and
    /// its control accept thread.
    ///
    /// # Errors
    ///
    /// Fails if the invoker is not freshly created or either listener
    /// cannot bind.
    pub fn start(&self) -> Result<(), BackhaulError> {
        self.inner.start()?;

        let core = self.inner.core().clone();
        let locator = core.locator();
        let listener = core
            .factory()
            .bind(
                locator.host(),
                locator.secondary_bind_port(),
                locator.backlog(),
            )
            .map_err(|source| TransportError::BindFailed {
                address: format!("{}:{}", locator.host(), locator.secondary_bind_port()),
                source,
            })?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::from)?;
        let bound = listener.local_addr().map_err(TransportError::from)?;
        *self.secondary_addr.lock() = Some(bound);
        core.set_secondary_port(bound.port());

        self.secondary_running.store(true, Ordering::SeqCst);
        let running = self.secondary_running.clone();
        let control = self.control.clone();
        let thread = thread::Builder::new()
            .name(format!("backhaul-control-{}", bound.port()))
            .spawn(move || control_accept_loop(core, control, listener, running))
            .map_err(TransportError::from)?;
        *self.secondary_thread.lock() = Some(thread);

        info!(secondary = %bound, "bisocket secondary listener started");
        Ok(())
    }

    /// Stops the secondary listener, closes every control pool, and stops
    /// the primary invoker.
    ///
    /// # Errors
    ///
    /// See [`SocketServerInvoker::stop`].
    pub fn stop(&self) -> Result<(), BackhaulError> {
        self.secondary_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.secondary_thread.lock().take() {
            let _ = thread.join();
        }
        self.control.close_all();
        self.inner.stop()
    }

    /// Destroys the invoker, releasing all pooled resources.
    pub fn destroy(&self) {
        if self.state() == InvokerState::Started {
            let _ = self.stop();
        }
        self.inner.destroy();
    }
}

impl Drop for BisocketServerInvoker {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Accepts control connections on the secondary listener and binds each to
/// its session.
fn control_accept_loop(
    core: Arc<ServerCore>,
    control: Arc<ControlPools>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!(%peer, "accepted control connection");
                if let Err(error) = admit_control(&core, &control, stream) {
                    debug!(%peer, %error, "rejected control connection");
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(SECONDARY_POLL_INTERVAL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                if running.load(Ordering::SeqCst) {
                    warn!(%error, "control accept failed");
                }
                break;
            }
        }
    }
    debug!("control accept loop exited");
}

/// Reads the handshake frame off a fresh control connection and pools it.
fn admit_control(
    core: &Arc<ServerCore>,
    control: &Arc<ControlPools>,
    stream: TcpStream,
) -> Result<(), BackhaulError> {
    let mut stream = stream;
    stream.set_nonblocking(false).map_err(TransportError::from)?;
    stream.set_nodelay(true).map_err(TransportError::from)?;
    // The handshake is bounded so one silent client cannot stall the
    // control acceptor.
    stream
        .set_read_timeout(Some(core.timeout()))
        .map_err(TransportError::from)?;
    stream
        .set_write_timeout(Some(core.timeout()))
        .map_err(TransportError::from)?;

    let message = core.unmarshaller().read_message(&mut stream)?;
    let request = match message {
        WireMessage::Request(request) => request,
        WireMessage::Response(_) => {
            return Err(BackhaulError::Transport(TransportError::ConnectionLost {
                reason: "control handshake sent a response frame".to_string(),
                source: None,
            }))
        }
    };
    if !matches!(request.operation, Operation::RegisterControl) {
        return Err(BackhaulError::Transport(TransportError::ConnectionLost {
            reason: "control handshake carried a non-control operation".to_string(),
            source: None,
        }));
    }

    core.marshaller()
        .write_message(&WireMessage::Response(InvocationResponse::ack()), &mut stream)?;
    control.register(request.session_id, stream);
    Ok(())
}
