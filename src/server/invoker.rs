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

//! The socket server invoker: accept loop, dispatch, and lifecycle.

use crate::bisocket::{ControlPools, ControlSink};
use crate::callback::{
    CallbackDispatcher, CallbackError, CallbackSink, CallbackStore, DiskCallbackStore,
    InMemoryCallbackStore,
};
use crate::error::BackhaulError;
use crate::handler::{ConnectionListener, ServerInvocationHandler};
use crate::invocation::{
    CallbackMode, InvocationRequest, InvocationResponse, ListenerId, Operation, ResponseBody,
    SessionId, PING_SUBSYSTEM,
};
use crate::locator::InvokerLocator;
use crate::marshal::{codec_for, Marshaller, UnMarshaller};
use crate::pool::{LruPool, OverflowPolicy, PoolError};
use crate::server::lease::LeaseRegistry;
use crate::server::worker::{spawn_worker, WorkerCommand, WorkerHandle};
use crate::server::WorkerId;
use crate::transport::{ConnectionFactory, ConnectionId, PlainConnectionFactory};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How often the accept thread re-checks the shutdown flag while the
/// listener has nothing to accept.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the reaper sweeps for expired leases.
const REAPER_INTERVAL: Duration = Duration::from_millis(250);

/// How long `stop()` waits for active workers to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a server invoker. Linear: once stopped, an invoker is never
/// restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerState {
    /// Constructed, not yet listening.
    Created,
    /// Accept loop running.
    Started,
    /// Listener closed, workers drained.
    Stopped,
    /// All resources released.
    Destroyed,
}

/// Monotonic counters for one server invoker.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    invocations_dispatched: AtomicU64,
    workers_created: AtomicU64,
}

/// Point-in-time view of a server invoker's counters and pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerMetricsSnapshot {
    /// Connections the accept loop has handed to workers.
    pub connections_accepted: u64,
    /// Invocations dispatched to subsystem handlers.
    pub invocations_dispatched: u64,
    /// Worker threads ever created.
    pub workers_created: u64,
    /// Workers currently serving a connection.
    pub active_workers: usize,
    /// Workers currently idle in the free list.
    pub idle_workers: usize,
}

/// A listener registration held by a session record.
struct SessionListener {
    subsystem: String,
    dispatcher: Arc<CallbackDispatcher>,
}

/// Shared state behind a [`SocketServerInvoker`], visible to the accept
/// thread, workers, and the reaper.
pub(crate) struct ServerCore {
    locator: InvokerLocator,
    factory: Arc<dyn ConnectionFactory>,
    marshaller: Box<dyn Marshaller>,
    unmarshaller: Box<dyn UnMarshaller>,
    handlers: RwLock<HashMap<String, Arc<dyn ServerInvocationHandler>>>,
    sessions: Mutex<HashMap<SessionId, HashMap<ListenerId, SessionListener>>>,
    busy: LruPool<ConnectionId, WorkerId>,
    free: LruPool<WorkerId, WorkerHandle>,
    /// Clones of streams being served, so `stop()` can abort blocked reads.
    active_streams: Mutex<HashMap<ConnectionId, TcpStream>>,
    leases: LeaseRegistry,
    running: AtomicBool,
    timeout: Duration,
    idle_timeout: Option<Duration>,
    check_connection: bool,
    /// Present on bisocket variants: per-session pools of client-originated
    /// control connections.
    control: Option<Arc<ControlPools>>,
    secondary_port: Mutex<Option<u16>>,
    metrics: ServerMetrics,
}

impl ServerCore {
    pub(crate) fn new(
        locator: InvokerLocator,
        factory: Arc<dyn ConnectionFactory>,
        control: Option<Arc<ControlPools>>,
    ) -> Arc<Self> {
        let (marshaller, unmarshaller) = codec_for(&locator);
        let max_pool_size = locator.max_pool_size();
        Arc::new(Self {
            timeout: locator.timeout(),
            idle_timeout: locator.idle_timeout(),
            check_connection: locator.check_connection(),
            busy: LruPool::new(max_pool_size, OverflowPolicy::Block),
            free: LruPool::new(max_pool_size, OverflowPolicy::Evict),
            active_streams: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            leases: LeaseRegistry::new(),
            running: AtomicBool::new(false),
            control,
            secondary_port: Mutex::new(None),
            metrics: ServerMetrics::default(),
            locator,
            factory,
            marshaller,
            unmarshaller,
        })
    }

    pub(crate) fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn busy_pool(&self) -> &LruPool<ConnectionId, WorkerId> {
        &self.busy
    }

    pub(crate) fn free_list(&self) -> &LruPool<WorkerId, WorkerHandle> {
        &self.free
    }

    pub(crate) fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub(crate) fn check_connection(&self) -> bool {
        self.check_connection
    }

    pub(crate) fn marshaller(&self) -> &dyn Marshaller {
        &*self.marshaller
    }

    pub(crate) fn unmarshaller(&self) -> &dyn UnMarshaller {
        &*self.unmarshaller
    }

    pub(crate) fn set_secondary_port(&self, port: u16) {
        *self.secondary_port.lock() = Some(port);
    }

    pub(crate) fn register_active(&self, connection_id: ConnectionId, stream: &TcpStream) {
        match stream.try_clone() {
            Ok(clone) => {
                self.active_streams.lock().insert(connection_id, clone);
            }
            Err(error) => trace!(%connection_id, %error, "could not clone stream for shutdown tracking"),
        }
    }

    pub(crate) fn unregister_active(&self, connection_id: &ConnectionId) {
        self.active_streams.lock().remove(connection_id);
    }

    fn metrics_snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            connections_accepted: self.metrics.connections_accepted.load(Ordering::Relaxed),
            invocations_dispatched: self.metrics.invocations_dispatched.load(Ordering::Relaxed),
            workers_created: self.metrics.workers_created.load(Ordering::Relaxed),
            active_workers: self.busy.size(),
            idle_workers: self.free.size(),
        }
    }

    /// Hands an accepted connection to a pooled worker, blocking when every
    /// worker slot is busy.
    pub(crate) fn assign(
        core: &Arc<Self>,
        stream: TcpStream,
        connection_id: ConnectionId,
    ) -> Result<(), PoolError> {
        let mut command = WorkerCommand::Serve {
            stream,
            connection_id,
        };
        loop {
            let worker = Self::obtain_worker(core)?;
            core.busy.insert(connection_id, worker.id)?;
            match worker.commands.send(command) {
                Ok(()) => return Ok(()),
                Err(crossbeam_channel::SendError(returned)) => {
                    // The worker exited between checkout and handoff; its
                    // thread is gone, so obtain another and hand it the same
                    // connection.
                    warn!(worker = %worker.id, "pooled worker died before handoff, replacing");
                    core.busy.remove(&connection_id);
                    command = returned;
                }
            }
        }
    }

    fn obtain_worker(core: &Arc<Self>) -> Result<WorkerHandle, PoolError> {
        if let Some((_, handle)) = core.free.take_mru() {
            return Ok(handle);
        }
        if core.busy.size() >= core.busy.capacity() {
            // At the worker cap: let the accepted burst sit in the backlog
            // until a worker frees a slot, then prefer the freed worker.
            core.busy.wait_below_capacity(None)?;
            if let Some((_, handle)) = core.free.take_mru() {
                return Ok(handle);
            }
        }
        core.metrics.workers_created.fetch_add(1, Ordering::Relaxed);
        Ok(spawn_worker(core.clone()))
    }

    /// Routes one request to its subsystem handler or internal operation.
    pub(crate) fn dispatch(&self, request: InvocationRequest) -> InvocationResponse {
        match &request.operation {
            Operation::Ping { lease } => {
                if let Some(lease) = lease {
                    self.leases.renew(
                        request.session_id.clone(),
                        Duration::from_millis(lease.period_ms),
                    );
                }
                InvocationResponse::ack()
            }
            Operation::Call { .. } | Operation::OneWay { .. } | Operation::DeliverCallback { .. } => {
                self.metrics
                    .invocations_dispatched
                    .fetch_add(1, Ordering::Relaxed);
                let handler = match self.handlers.read().get(&request.subsystem) {
                    Some(handler) => handler.clone(),
                    None => {
                        return InvocationResponse::fault(format!(
                            "no subsystem {:?} registered",
                            request.subsystem
                        ))
                    }
                };
                match handler.invoke(&request) {
                    Ok(payload) => InvocationResponse::value(payload),
                    Err(fault) => InvocationResponse::fault(fault.message),
                }
            }
            Operation::AddListener {
                listener_id,
                mode,
                callback_locator,
            } => self.add_listener(&request, *listener_id, *mode, callback_locator.as_deref()),
            Operation::RemoveListener { listener_id } => {
                self.remove_listener(&request.session_id, *listener_id)
            }
            Operation::PollCallbacks {
                listener_id,
                include_statistics,
            } => self.poll_callbacks(&request.session_id, *listener_id, *include_statistics),
            Operation::Acknowledge {
                listener_id,
                callback_ids,
            } => {
                let sessions = self.sessions.lock();
                match sessions
                    .get(&request.session_id)
                    .and_then(|listeners| listeners.get(listener_id))
                {
                    Some(listener) => {
                        listener.dispatcher.acknowledge(callback_ids);
                        InvocationResponse::ack()
                    }
                    None => InvocationResponse::fault(
                        CallbackError::UnknownListener {
                            listener_id: *listener_id,
                        }
                        .to_string(),
                    ),
                }
            }
            Operation::RegisterControl => {
                // Control registration is consumed by the bisocket secondary
                // acceptor; reaching a worker means the client dialed the
                // primary port.
                InvocationResponse::fault("control connections must dial the secondary port")
            }
            Operation::GetSecondaryPort => match *self.secondary_port.lock() {
                Some(port) => InvocationResponse {
                    body: ResponseBody::SecondaryPort(port),
                },
                None => InvocationResponse::fault("this server has no secondary listener"),
            },
        }
    }

    fn add_listener(
        &self,
        request: &InvocationRequest,
        listener_id: ListenerId,
        mode: CallbackMode,
        callback_locator: Option<&str>,
    ) -> InvocationResponse {
        if request.subsystem == PING_SUBSYSTEM {
            return InvocationResponse::fault("cannot register listeners on the ping subsystem");
        }
        let handler = match self.handlers.read().get(&request.subsystem) {
            Some(handler) => handler.clone(),
            None => {
                return InvocationResponse::fault(format!(
                    "no subsystem {:?} registered",
                    request.subsystem
                ))
            }
        };

        let store = match self.build_store(listener_id) {
            Ok(store) => store,
            Err(error) => return InvocationResponse::fault(error.to_string()),
        };
        let origin = Some(self.locator.to_string());
        let session_id = request.session_id.clone();

        let dispatcher = match mode {
            CallbackMode::Pull => CallbackDispatcher::pull(
                listener_id,
                session_id.clone(),
                request.subsystem.clone(),
                origin,
                store,
            ),
            CallbackMode::Push => {
                let sink: Box<dyn CallbackSink> = match callback_locator {
                    Some(locator) => match self.direct_sink(locator, listener_id) {
                        Ok(sink) => sink,
                        Err(error) => return InvocationResponse::fault(error.to_string()),
                    },
                    None => match &self.control {
                        Some(pools) => Box::new(ControlSink::new(
                            pools.clone(),
                            session_id.clone(),
                            self.marshaller.boxed_clone(),
                            self.unmarshaller.boxed_clone(),
                            self.timeout,
                        )),
                        None => {
                            return InvocationResponse::fault(
                                "push mode requires a callback locator or a bisocket transport",
                            )
                        }
                    },
                };
                CallbackDispatcher::push(
                    listener_id,
                    session_id.clone(),
                    request.subsystem.clone(),
                    origin,
                    sink,
                    store,
                )
            }
        };

        let dispatcher = Arc::new(dispatcher);
        self.sessions
            .lock()
            .entry(session_id)
            .or_default()
            .insert(
                listener_id,
                SessionListener {
                    subsystem: request.subsystem.clone(),
                    dispatcher: dispatcher.clone(),
                },
            );
        handler.add_listener(dispatcher);
        debug!(%listener_id, subsystem = %request.subsystem, ?mode, "listener registered");
        InvocationResponse::ack()
    }

    /// Builds the spillover/pull store a new listener registration asked
    /// for: in-memory by default, disk-spooled when the locator says so.
    fn build_store(&self, listener_id: ListenerId) -> Result<Box<dyn CallbackStore>, CallbackError> {
        let ceiling = self.locator.callback_memory_ceiling();
        match self.locator.parameter(crate::locator::params::CALLBACK_STORE) {
            None | Some("memory") => Ok(Box::new(InMemoryCallbackStore::new(ceiling))),
            Some("disk") => {
                let base = self
                    .locator
                    .parameter(crate::locator::params::CALLBACK_STORE_DIRECTORY)
                    .unwrap_or("callback-spool");
                let directory = std::path::Path::new(base).join(format!("{listener_id}"));
                Ok(Box::new(DiskCallbackStore::open(directory, ceiling)?))
            }
            Some(other) => {
                warn!(store = other, "unknown callback store requested, using memory");
                Ok(Box::new(InMemoryCallbackStore::new(ceiling)))
            }
        }
    }

    fn direct_sink(
        &self,
        locator: &str,
        listener_id: ListenerId,
    ) -> Result<Box<dyn CallbackSink>, BackhaulError> {
        let locator = InvokerLocator::parse(locator)?;
        let invoker = Arc::new(crate::client::SocketClientInvoker::new(locator));
        Ok(Box::new(DirectCallbackSink {
            invoker,
            listener_id,
        }))
    }

    fn remove_listener(
        &self,
        session_id: &SessionId,
        listener_id: ListenerId,
    ) -> InvocationResponse {
        let removed = self
            .sessions
            .lock()
            .get_mut(session_id)
            .and_then(|listeners| listeners.remove(&listener_id));
        match removed {
            Some(listener) => {
                listener.dispatcher.close();
                if let Some(handler) = self.handlers.read().get(&listener.subsystem) {
                    handler.remove_listener(listener_id);
                }
                InvocationResponse::ack()
            }
            None => InvocationResponse::fault(
                CallbackError::UnknownListener { listener_id }.to_string(),
            ),
        }
    }

    fn poll_callbacks(
        &self,
        session_id: &SessionId,
        listener_id: ListenerId,
        include_statistics: bool,
    ) -> InvocationResponse {
        let dispatcher = self
            .sessions
            .lock()
            .get(session_id)
            .and_then(|listeners| listeners.get(&listener_id))
            .map(|listener| listener.dispatcher.clone());
        match dispatcher {
            Some(dispatcher) => match dispatcher.poll(include_statistics) {
                Ok((callbacks, statistics)) => InvocationResponse {
                    body: ResponseBody::Callbacks {
                        callbacks,
                        statistics,
                    },
                },
                Err(error) => InvocationResponse::fault(error.to_string()),
            },
            None => InvocationResponse::fault(
                CallbackError::UnknownListener { listener_id }.to_string(),
            ),
        }
    }

    /// Tears down one session: its listeners, dispatchers, and control
    /// connections. Driven by the lease reaper and by `destroy()`.
    pub(crate) fn terminate_session(&self, session_id: &SessionId) {
        let listeners = self.sessions.lock().remove(session_id);
        if let Some(listeners) = listeners {
            for (listener_id, listener) in listeners {
                listener.dispatcher.close();
                if let Some(handler) = self.handlers.read().get(&listener.subsystem) {
                    handler.remove_listener(listener_id);
                }
            }
        }
        if let Some(control) = &self.control {
            control.remove_session(session_id);
        }
    }

    fn teardown_all_sessions(&self) {
        let session_ids: Vec<SessionId> = self.sessions.lock().keys().cloned().collect();
        for session_id in session_ids {
            self.terminate_session(&session_id);
        }
    }

    fn shutdown_active_streams(&self) {
        let streams = self.active_streams.lock();
        for (connection_id, stream) in streams.iter() {
            trace!(%connection_id, "aborting active connection for shutdown");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Pushes callbacks by invoking the client's own callback receiver over an
/// ordinary outbound socket.
struct DirectCallbackSink {
    invoker: Arc<crate::client::SocketClientInvoker>,
    listener_id: ListenerId,
}

impl CallbackSink for DirectCallbackSink {
    fn deliver(&self, request: &InvocationRequest) -> Result<(), CallbackError> {
        let response =
            self.invoker
                .invoke(request.clone())
                .map_err(|error| CallbackError::DeliveryFailed {
                    listener_id: self.listener_id,
                    reason: error.to_string(),
                })?;
        match response.body {
            ResponseBody::Ack | ResponseBody::Value(_) => Ok(()),
            ResponseBody::Fault(message) => Err(CallbackError::DeliveryFailed {
                listener_id: self.listener_id,
                reason: message,
            }),
            other => Err(CallbackError::DeliveryFailed {
                listener_id: self.listener_id,
                reason: format!("unexpected delivery response: {other:?}"),
            }),
        }
    }
}

/// A server invoker listening on a plain socket.
///
/// Lifecycle is linear, `Created → Started → Stopped → Destroyed`, with no
/// re-entry to `Started`. All methods take `&self`; the invoker is intended
/// to live in an `Arc` shared with whatever owns the process lifecycle.
///
/// # Examples
///
/// ```rust,no_run
/// use backhaul::handler::{InvocationFault, ServerInvocationHandler};
/// use backhaul::invocation::{InvocationRequest, Payload};
/// use backhaul::locator::InvokerLocator;
/// use backhaul::server::SocketServerInvoker;
/// use std::sync::Arc;
///
/// struct Uppercase;
///
/// impl ServerInvocationHandler for Uppercase {
///     fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
///         let text = request.operation.payload()
///             .and_then(|p| p.as_str())
///             .ok_or_else(|| InvocationFault::new("expected a string"))?;
///         Ok(Payload::from(text.to_uppercase()))
///     }
/// }
///
/// # fn main() -> Result<(), backhaul::BackhaulError> {
/// let locator = InvokerLocator::parse("socket://0.0.0.0:5400/?maxPoolSize=32")?;
/// let server = SocketServerInvoker::new(locator);
/// server.register_handler("text", Arc::new(Uppercase))?;
/// server.start()?;
/// // ... serve until shutdown ...
/// server.stop()?;
/// server.destroy();
/// # Ok(())
/// # }
/// ```
pub struct SocketServerInvoker {
    core: Arc<ServerCore>,
    state: Mutex<InvokerState>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    reaper_thread: Mutex<Option<JoinHandle<()>>>,
    reaper_shutdown: Mutex<Option<Sender<()>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl SocketServerInvoker {
    /// Creates an invoker for `locator` with the plain TCP factory.
    #[must_use]
    pub fn new(locator: InvokerLocator) -> Self {
        Self::with_factory(locator, Arc::new(PlainConnectionFactory))
    }

    /// Creates an invoker with an alternative [`ConnectionFactory`], e.g. an
    /// SSL-wrapping one.
    #[must_use]
    pub fn with_factory(locator: InvokerLocator, factory: Arc<dyn ConnectionFactory>) -> Self {
        let core = ServerCore::new(locator, factory, None);
        Self::from_core(core)
    }

    pub(crate) fn from_core(core: Arc<ServerCore>) -> Self {
        Self {
            core,
            state: Mutex::new(InvokerState::Created),
            accept_thread: Mutex::new(None),
            reaper_thread: Mutex::new(None),
            reaper_shutdown: Mutex::new(None),
            bound_addr: Mutex::new(None),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// The invoker's locator.
    pub fn locator(&self) -> &InvokerLocator {
        self.core.locator()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InvokerState {
        *self.state.lock()
    }

    /// The address actually bound, once started. Useful with port 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Point-in-time metrics.
    pub fn metrics(&self) -> ServerMetricsSnapshot {
        self.core.metrics_snapshot()
    }

    /// The server-side lease registry.
    pub fn leases(&self) -> &LeaseRegistry {
        self.core.leases()
    }

    /// Registers an observer for expired client sessions.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.leases().add_listener(listener);
    }

    /// Registers the handler for a named subsystem.
    ///
    /// # Errors
    ///
    /// Rejects the reserved `$PING$` subsystem and registration on a
    /// destroyed invoker.
    pub fn register_handler(
        &self,
        subsystem: impl Into<String>,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Result<(), BackhaulError> {
        let subsystem = subsystem.into();
        if subsystem == PING_SUBSYSTEM {
            return Err(BackhaulError::Configuration {
                message: format!("subsystem name {PING_SUBSYSTEM:?} is reserved for probes"),
            });
        }
        if *self.state.lock() == InvokerState::Destroyed {
            return Err(BackhaulError::InvalidState {
                message: "cannot register handlers on a destroyed invoker".to_string(),
            });
        }
        handler.on_registered(self.core.locator());
        self.core
            .handlers
            .write()
            .insert(subsystem.clone(), handler);
        debug!(subsystem, "handler registered");
        Ok(())
    }

    /// Removes a subsystem handler, notifying it.
    pub fn unregister_handler(&self, subsystem: &str) {
        if let Some(handler) = self.core.handlers.write().remove(subsystem) {
            handler.on_unregistered();
        }
    }

    /// Binds the listener and starts the accept and reaper threads.
    ///
    /// # Errors
    ///
    /// Fails if the invoker is not freshly created or the listener cannot
    /// bind.
    pub fn start(&self) -> Result<(), BackhaulError> {
        let mut state = self.state.lock();
        if *state != InvokerState::Created {
            return Err(BackhaulError::InvalidState {
                message: format!("cannot start invoker in state {:?}", *state),
            });
        }

        let locator = self.core.locator();
        let listener = self
            .core
            .factory()
            .bind(locator.host(), locator.port(), locator.backlog())
            .map_err(|source| crate::transport::TransportError::BindFailed {
                address: format!("{}:{}", locator.host(), locator.port()),
                source,
            })?;
        // Non-blocking accept lets the thread observe shutdown without a
        // connection arriving to unblock it.
        listener
            .set_nonblocking(true)
            .map_err(crate::transport::TransportError::from)?;
        let bound = listener
            .local_addr()
            .map_err(crate::transport::TransportError::from)?;
        *self.bound_addr.lock() = Some(bound);

        self.core.running.store(true, Ordering::SeqCst);

        let accept_core = self.core.clone();
        let accept = thread::Builder::new()
            .name(format!("backhaul-accept-{}", bound.port()))
            .spawn(move || accept_loop(accept_core, listener))
            .map_err(crate::transport::TransportError::from)?;
        *self.accept_thread.lock() = Some(accept);

        let (reaper_tx, reaper_rx) = bounded::<()>(1);
        let reaper_core = self.core.clone();
        let reaper = thread::Builder::new()
            .name(format!("backhaul-reaper-{}", bound.port()))
            .spawn(move || loop {
                match reaper_rx.recv_timeout(REAPER_INTERVAL) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        for session in reaper_core.leases().expire_overdue() {
                            reaper_core.terminate_session(&session);
                        }
                    }
                    _ => break,
                }
            })
            .map_err(crate::transport::TransportError::from)?;
        *self.reaper_thread.lock() = Some(reaper);
        *self.reaper_shutdown.lock() = Some(reaper_tx);

        *state = InvokerState::Started;
        info!(locator = %self.core.locator(), %bound, "server invoker started");
        Ok(())
    }

    /// Closes the listener and winds down workers.
    ///
    /// The accept thread treats the closing listener as shutdown rather
    /// than a fault. Active workers are aborted by shutting their sockets
    /// down, then given [`SHUTDOWN_TIMEOUT`] to drain.
    ///
    /// # Errors
    ///
    /// Fails if the invoker was never started. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<(), BackhaulError> {
        {
            let mut state = self.state.lock();
            match *state {
                InvokerState::Started => *state = InvokerState::Stopped,
                InvokerState::Stopped => return Ok(()),
                other => {
                    return Err(BackhaulError::InvalidState {
                        message: format!("cannot stop invoker in state {other:?}"),
                    })
                }
            }
        }

        info!(locator = %self.core.locator(), "stopping server invoker");
        self.core.running.store(false, Ordering::SeqCst);

        // Unblock workers stuck in reads, then release pooled resources.
        self.core.shutdown_active_streams();
        self.core.busy.close();
        self.core.free.close();
        for (_, worker) in self.core.free.drain() {
            let _ = worker.commands.send(WorkerCommand::Shutdown);
        }

        if let Some(sender) = self.reaper_shutdown.lock().take() {
            let _ = sender.send(());
        }
        if let Some(thread) = self.accept_thread.lock().take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.reaper_thread.lock().take() {
            let _ = thread.join();
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while self.core.busy.size() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.core.busy.size() > 0 {
            warn!(
                remaining = self.core.busy.size(),
                "workers still active after shutdown timeout"
            );
        }
        Ok(())
    }

    /// Releases every pooled resource and unregisters handlers.
    ///
    /// Stops the invoker first if it is still running.
    pub fn destroy(&self) {
        if self.state() == InvokerState::Started {
            let _ = self.stop();
        }
        {
            let mut state = self.state.lock();
            if *state == InvokerState::Destroyed {
                return;
            }
            *state = InvokerState::Destroyed;
        }
        self.core.teardown_all_sessions();
        let handlers: Vec<Arc<dyn ServerInvocationHandler>> =
            self.core.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.on_unregistered();
        }
        info!(locator = %self.core.locator(), "server invoker destroyed");
    }
}

impl Drop for SocketServerInvoker {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The accept loop: the only thread that touches the listening socket.
fn accept_loop(core: Arc<ServerCore>, listener: TcpListener) {
    while core.is_running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                core.metrics
                    .connections_accepted
                    .fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "accepted connection");
                let connection_id = ConnectionId::next();
                if let Err(error) = ServerCore::assign(&core, stream, connection_id) {
                    // Pool closed means shutdown raced the accept.
                    debug!(%error, "dropping accepted connection");
                    if !core.is_running() {
                        break;
                    }
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                if core.is_running() {
                    error!(%error, "accept failed");
                }
                break;
            }
        }
    }
    debug!("accept loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::InvocationFault;
    use crate::invocation::{Payload, WireMessage};
    use crate::marshal::JsonMarshaller;

    struct Echo;

    impl ServerInvocationHandler for Echo {
        fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
            match request.operation.payload() {
                Some(payload) => Ok(payload.clone()),
                None => Err(InvocationFault::new("no payload")),
            }
        }
    }

    fn start_server(query: &str) -> SocketServerInvoker {
        let locator =
            InvokerLocator::parse(&format!("socket://127.0.0.1:0/?{query}")).unwrap();
        let server = SocketServerInvoker::new(locator);
        server.register_handler("echo", Arc::new(Echo)).unwrap();
        server.start().unwrap();
        server
    }

    fn raw_exchange(stream: &mut TcpStream, request: &InvocationRequest) -> InvocationResponse {
        let codec = JsonMarshaller;
        codec
            .write_message(&WireMessage::Request(request.clone()), stream)
            .unwrap();
        match codec.read_message(stream).unwrap() {
            WireMessage::Response(response) => response,
            WireMessage::Request(_) => panic!("expected a response frame"),
        }
    }

    fn call(session: &SessionId, payload: Payload) -> InvocationRequest {
        InvocationRequest {
            session_id: session.clone(),
            subsystem: "echo".to_string(),
            operation: Operation::Call { payload },
        }
    }

    #[test]
    fn test_lifecycle_is_linear() {
        let locator = InvokerLocator::parse("socket://127.0.0.1:0/").unwrap();
        let server = SocketServerInvoker::new(locator);
        assert_eq!(server.state(), InvokerState::Created);
        assert!(server.stop().is_err());

        server.start().unwrap();
        assert_eq!(server.state(), InvokerState::Started);
        assert!(server.start().is_err());

        server.stop().unwrap();
        assert_eq!(server.state(), InvokerState::Stopped);
        assert!(server.start().is_err());
        server.stop().unwrap(); // idempotent

        server.destroy();
        assert_eq!(server.state(), InvokerState::Destroyed);
    }

    #[test]
    fn test_dispatch_and_connection_reuse() {
        let server = start_server("timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        let mut stream = TcpStream::connect(addr).unwrap();
        // Two invocations on the same connection: keep-alive.
        for i in 0..2 {
            let response = raw_exchange(&mut stream, &call(&session, Payload::from(i)));
            assert_eq!(response.body, ResponseBody::Value(Payload::from(i)));
        }
        let metrics = server.metrics();
        assert_eq!(metrics.connections_accepted, 1);
        assert_eq!(metrics.invocations_dispatched, 2);

        server.stop().unwrap();
        server.destroy();
    }

    #[test]
    fn test_unknown_subsystem_is_a_fault() {
        let server = start_server("");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        let mut stream = TcpStream::connect(addr).unwrap();
        let mut request = call(&session, Payload::from(1));
        request.subsystem = "nonexistent".to_string();
        let response = raw_exchange(&mut stream, &request);
        assert!(matches!(response.body, ResponseBody::Fault(_)));
    }

    #[test]
    fn test_dead_connection_returns_worker_for_reuse() {
        let server = start_server("timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        {
            let mut stream = TcpStream::connect(addr).unwrap();
            raw_exchange(&mut stream, &call(&session, Payload::from(1)));
        } // connection dropped

        // The worker should land back in the free list.
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.metrics().idle_workers == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.metrics().idle_workers, 1);

        // A second connection reuses the pooled worker instead of creating
        // a new identity.
        let mut stream = TcpStream::connect(addr).unwrap();
        raw_exchange(&mut stream, &call(&session, Payload::from(2)));
        assert_eq!(server.metrics().workers_created, 1);

        server.stop().unwrap();
    }

    #[test]
    fn test_idle_timeout_shrinks_pool_to_zero() {
        let server = start_server("idleTimeout=1&timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        {
            let mut stream = TcpStream::connect(addr).unwrap();
            raw_exchange(&mut stream, &call(&session, Payload::from(1)));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let metrics = server.metrics();
            if metrics.active_workers == 0 && metrics.idle_workers == 0 {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "free list did not shrink to zero: {metrics:?}"
            );
            thread::sleep(Duration::from_millis(50));
        }

        server.stop().unwrap();
    }

    #[test]
    fn test_max_pool_size_applies_backpressure() {
        let server = start_server("maxPoolSize=1&timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        let mut first = TcpStream::connect(addr).unwrap();
        let response = raw_exchange(&mut first, &call(&session, Payload::from(1)));
        assert_eq!(response.body, ResponseBody::Value(Payload::from(1)));

        // With the single worker occupied, a second connection is accepted
        // by the OS but not served until the first closes.
        let mut second = TcpStream::connect(addr).unwrap();
        let codec = JsonMarshaller;
        codec
            .write_message(
                &WireMessage::Request(call(&session, Payload::from(2))),
                &mut second,
            )
            .unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(server.metrics().active_workers, 1);

        drop(first);
        let response = match codec.read_message(&mut second).unwrap() {
            WireMessage::Response(response) => response,
            WireMessage::Request(_) => panic!("expected a response"),
        };
        assert_eq!(response.body, ResponseBody::Value(Payload::from(2)));
        assert_eq!(server.metrics().workers_created, 1);

        server.stop().unwrap();
    }

    #[test]
    fn test_oneway_writes_no_response() {
        let server = start_server("timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();
        let codec = JsonMarshaller;

        let mut stream = TcpStream::connect(addr).unwrap();
        let oneway = InvocationRequest {
            session_id: session.clone(),
            subsystem: "echo".to_string(),
            operation: Operation::OneWay {
                payload: Payload::from("fire and forget"),
            },
        };
        codec
            .write_message(&WireMessage::Request(oneway), &mut stream)
            .unwrap();

        // The next exchange on the same connection still works and returns
        // the response for the *second* request, proving the one-way wrote
        // nothing.
        let response = raw_exchange(&mut stream, &call(&session, Payload::from("after")));
        assert_eq!(response.body, ResponseBody::Value(Payload::from("after")));

        server.stop().unwrap();
    }

    #[test]
    fn test_ping_renews_lease_and_reaper_expires_it() {
        let server = start_server("timeout=5000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        let mut stream = TcpStream::connect(addr).unwrap();
        let ping = InvocationRequest {
            session_id: session.clone(),
            subsystem: PING_SUBSYSTEM.to_string(),
            operation: Operation::Ping {
                lease: Some(crate::invocation::LeaseRequest { period_ms: 300 }),
            },
        };
        let response = raw_exchange(&mut stream, &ping);
        assert_eq!(response.body, ResponseBody::Ack);
        assert!(server.leases().is_leased(&session));

        // No renewals: the reaper should expire the session.
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.leases().is_leased(&session) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!server.leases().is_leased(&session));

        server.stop().unwrap();
    }

    #[test]
    fn test_validator_ping_creates_no_lease() {
        let server = start_server("");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        let mut stream = TcpStream::connect(addr).unwrap();
        let ping = InvocationRequest {
            session_id: session.clone(),
            subsystem: PING_SUBSYSTEM.to_string(),
            operation: Operation::Ping { lease: None },
        };
        let response = raw_exchange(&mut stream, &ping);
        assert_eq!(response.body, ResponseBody::Ack);
        assert!(!server.leases().is_leased(&session));

        server.stop().unwrap();
    }

    #[test]
    fn test_stop_aborts_blocked_workers() {
        let server = start_server("timeout=60000");
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();

        // Occupy a worker with a connection that never sends again.
        let mut stream = TcpStream::connect(addr).unwrap();
        raw_exchange(&mut stream, &call(&session, Payload::from(1)));
        assert_eq!(server.metrics().active_workers, 1);

        let started = Instant::now();
        server.stop().unwrap();
        assert!(
            started.elapsed() < SHUTDOWN_TIMEOUT,
            "stop() waited out the full shutdown timeout"
        );
        assert_eq!(server.metrics().active_workers, 0);
    }

    #[test]
    fn test_pull_callback_round_trip() {
        struct Notifier {
            dispatchers: Mutex<Vec<Arc<CallbackDispatcher>>>,
        }
        impl ServerInvocationHandler for Notifier {
            fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
                // Each call fans one callback out to every listener.
                for dispatcher in self.dispatchers.lock().iter() {
                    let payload = request.operation.payload().cloned().unwrap_or(Payload::Null);
                    let _ = dispatcher.handle_callback(payload);
                }
                Ok(Payload::Null)
            }
            fn add_listener(&self, dispatcher: Arc<CallbackDispatcher>) {
                self.dispatchers.lock().push(dispatcher);
            }
        }

        let locator = InvokerLocator::parse("socket://127.0.0.1:0/?timeout=5000").unwrap();
        let server = SocketServerInvoker::new(locator);
        server
            .register_handler(
                "events",
                Arc::new(Notifier {
                    dispatchers: Mutex::new(Vec::new()),
                }),
            )
            .unwrap();
        server.start().unwrap();
        let addr = server.bound_addr().unwrap();
        let session = SessionId::generate();
        let listener_id = ListenerId::next();

        let mut stream = TcpStream::connect(addr).unwrap();
        let register = InvocationRequest {
            session_id: session.clone(),
            subsystem: "events".to_string(),
            operation: Operation::AddListener {
                listener_id,
                mode: CallbackMode::Pull,
                callback_locator: None,
            },
        };
        assert_eq!(raw_exchange(&mut stream, &register).body, ResponseBody::Ack);

        for i in 0..3 {
            let request = InvocationRequest {
                session_id: session.clone(),
                subsystem: "events".to_string(),
                operation: Operation::Call {
                    payload: Payload::from(i),
                },
            };
            raw_exchange(&mut stream, &request);
        }

        let poll = InvocationRequest {
            session_id: session.clone(),
            subsystem: "events".to_string(),
            operation: Operation::PollCallbacks {
                listener_id,
                include_statistics: true,
            },
        };
        let response = raw_exchange(&mut stream, &poll);
        match response.body {
            ResponseBody::Callbacks {
                callbacks,
                statistics,
            } => {
                let values: Vec<i64> = callbacks
                    .iter()
                    .map(|cb| cb.payload.as_i64().unwrap())
                    .collect();
                assert_eq!(values, vec![0, 1, 2]);
                assert_eq!(statistics.unwrap().delivered, 3);
            }
            other => panic!("expected callbacks, got {other:?}"),
        }

        server.stop().unwrap();
    }
}
