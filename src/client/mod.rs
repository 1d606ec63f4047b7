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

//! Client-side invokers and the logical [`Client`] handle.
//!
//! A [`Client`] is one logical connection to a named server endpoint.
//! Underneath, client invokers are deduplicated through an
//! [`InvokerRegistry`] keyed by locator signature and reference-counted
//! across handles, so many `Client`s to the same endpoint share one
//! connection pool and session. Liveness is probed by the [`LeasePinger`]
//! (server-side session keep-alive) and the [`ConnectionValidator`]
//! (failure detection), each on its own timer thread.

mod invoker;
mod pinger;
mod registry;
mod validator;

pub use invoker::SocketClientInvoker;
pub use pinger::LeasePinger;
pub use registry::InvokerRegistry;
pub use validator::ConnectionValidator;

use crate::bisocket::CallbackEndpoint;
use crate::error::BackhaulError;
use crate::handler::{
    ConnectionFailureListener, InvocationFault, InvokerCallbackHandler, ServerInvocationHandler,
};
use crate::invocation::{
    Callback, CallbackId, CallbackMode, DeliveryStatistics, InvocationRequest, ListenerId,
    Operation, Payload, ResponseBody, SessionId, PING_SUBSYSTEM,
};
use crate::locator::InvokerLocator;
use crate::server::SocketServerInvoker;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bookkeeping for one listener this client registered remotely.
struct RegisteredListener {
    subsystem: String,
    mode: CallbackMode,
}

/// Routes direct-push deliveries arriving at this client's local callback
/// receiver to the right [`InvokerCallbackHandler`].
#[derive(Default)]
struct CallbackReceiverHandler {
    handlers: Mutex<HashMap<ListenerId, Arc<dyn InvokerCallbackHandler>>>,
}

impl CallbackReceiverHandler {
    fn register(&self, listener_id: ListenerId, handler: Arc<dyn InvokerCallbackHandler>) {
        self.handlers.lock().insert(listener_id, handler);
    }

    fn unregister(&self, listener_id: ListenerId) {
        self.handlers.lock().remove(&listener_id);
    }
}

impl ServerInvocationHandler for CallbackReceiverHandler {
    fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
        let Operation::DeliverCallback { callback } = &request.operation else {
            return Err(InvocationFault::new(
                "callback receiver only accepts deliveries",
            ));
        };
        let listener_id = callback
            .metadata
            .map(|metadata| metadata.listener_id)
            .ok_or_else(|| InvocationFault::new("delivery without listener metadata"))?;
        let handler = self
            .handlers
            .lock()
            .get(&listener_id)
            .cloned()
            .ok_or_else(|| InvocationFault::new(format!("no handler for {listener_id}")))?;
        handler
            .handle_callback(callback.clone())
            .map(|()| Payload::Null)
            .map_err(|error| InvocationFault::new(error.to_string()))
    }
}

/// A logical client handle to one server endpoint.
///
/// Handles are cheap: those naming the same endpoint and configuration
/// share one underlying [`SocketClientInvoker`] through the registry, and
/// the invoker is torn down when the last handle disconnects. Every
/// invocation blocks the calling thread until its response, timeout, or
/// connection failure.
///
/// # Examples
///
/// ```rust,no_run
/// use backhaul::client::{Client, InvokerRegistry};
/// use backhaul::locator::InvokerLocator;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), backhaul::BackhaulError> {
/// let registry = Arc::new(InvokerRegistry::new());
/// let locator = InvokerLocator::parse("socket://10.0.0.7:4446/?timeout=5000")?;
///
/// let client = Client::new(registry, locator);
/// client.connect()?;
/// let reply = client.invoke("inventory", serde_json::json!({"sku": "X-11"}))?;
/// println!("{reply}");
/// client.disconnect();
/// # Ok(())
/// # }
/// ```
pub struct Client {
    registry: Arc<InvokerRegistry>,
    locator: InvokerLocator,
    invoker: Mutex<Option<Arc<SocketClientInvoker>>>,
    pinger: Mutex<Option<LeasePinger>>,
    validator: Mutex<Option<ConnectionValidator>>,
    failure_listeners: Arc<Mutex<Vec<Arc<dyn ConnectionFailureListener>>>>,
    listeners: Mutex<HashMap<ListenerId, RegisteredListener>>,
    callback_endpoint: Mutex<Option<Arc<CallbackEndpoint>>>,
    callback_server: Mutex<Option<(SocketServerInvoker, Arc<CallbackReceiverHandler>)>>,
}

impl Client {
    /// Creates a disconnected handle for `locator`.
    #[must_use]
    pub fn new(registry: Arc<InvokerRegistry>, locator: InvokerLocator) -> Self {
        Self {
            registry,
            locator,
            invoker: Mutex::new(None),
            pinger: Mutex::new(None),
            validator: Mutex::new(None),
            failure_listeners: Arc::new(Mutex::new(Vec::new())),
            listeners: Mutex::new(HashMap::new()),
            callback_endpoint: Mutex::new(None),
            callback_server: Mutex::new(None),
        }
    }

    /// The endpoint this handle names.
    pub fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    /// Whether [`connect`](Self::connect) has been called without a
    /// matching disconnect.
    pub fn is_connected(&self) -> bool {
        self.invoker.lock().is_some()
    }

    /// This handle's session identity, once connected.
    pub fn session_id(&self) -> Option<SessionId> {
        self.invoker
            .lock()
            .as_ref()
            .map(|invoker| invoker.session_id().clone())
    }

    /// The lease pinger's (invoked, succeeded) flags, when leasing is
    /// active.
    pub fn lease_ping_status(&self) -> Option<(bool, bool)> {
        self.pinger
            .lock()
            .as_ref()
            .map(|pinger| (pinger.ping_invoked(), pinger.ping_succeeded()))
    }

    /// Acquires (or shares) the underlying invoker and starts lease
    /// keep-alive if the locator asks for it.
    ///
    /// # Errors
    ///
    /// Fails if the handle is already connected.
    pub fn connect(&self) -> Result<(), BackhaulError> {
        let mut guard = self.invoker.lock();
        if guard.is_some() {
            return Err(BackhaulError::InvalidState {
                message: "client is already connected".to_string(),
            });
        }
        let invoker = self.registry.acquire(&self.locator);

        if self.locator.enable_lease() {
            let timeout = self
                .locator
                .lease_pinger_timeout()
                .unwrap_or_else(|| invoker.timeout());
            *self.pinger.lock() = Some(LeasePinger::start(
                invoker.clone(),
                self.locator.lease_period(),
                timeout,
                self.failure_hook(),
            ));
        }
        if !self.failure_listeners.lock().is_empty() {
            self.start_validator(&invoker);
        }

        *guard = Some(invoker);
        debug!(locator = %self.locator, "client connected");
        Ok(())
    }

    /// Releases this handle's reference to the shared invoker, stopping
    /// probes and unregistering any listeners best-effort.
    ///
    /// Disconnecting an unconnected handle is a no-op.
    pub fn disconnect(&self) {
        let Some(invoker) = self.invoker.lock().take() else {
            return;
        };

        let registered: Vec<(ListenerId, String)> = self
            .listeners
            .lock()
            .drain()
            .map(|(id, listener)| (id, listener.subsystem))
            .collect();
        for (listener_id, subsystem) in registered {
            let request = InvocationRequest {
                session_id: invoker.session_id().clone(),
                subsystem,
                operation: Operation::RemoveListener { listener_id },
            };
            if let Err(error) = invoker.invoke(request) {
                debug!(%listener_id, %error, "listener removal failed during disconnect");
            }
        }

        if let Some(pinger) = self.pinger.lock().take() {
            pinger.stop();
        }
        if let Some(validator) = self.validator.lock().take() {
            validator.stop();
        }
        if let Some(endpoint) = self.callback_endpoint.lock().take() {
            endpoint.close();
        }
        if let Some((server, _)) = self.callback_server.lock().take() {
            let _ = server.stop();
            server.destroy();
        }

        self.registry.release(&self.locator);
        debug!(locator = %self.locator, "client disconnected");
    }

    /// Performs one blocking invocation against a named subsystem.
    ///
    /// # Errors
    ///
    /// A typed transport failure, or [`BackhaulError::Invocation`] when the
    /// remote handler raised an application fault.
    pub fn invoke(&self, subsystem: &str, payload: Payload) -> Result<Payload, BackhaulError> {
        let invoker = self.require_invoker()?;
        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem: subsystem.to_string(),
            operation: Operation::Call { payload },
        };
        let response = invoker.invoke(request)?;
        Self::unwrap_value(response.body)
    }

    /// Fires an invocation without waiting for any response.
    ///
    /// # Errors
    ///
    /// Only transport-level failures; application faults are invisible to
    /// one-way callers.
    pub fn invoke_oneway(&self, subsystem: &str, payload: Payload) -> Result<(), BackhaulError> {
        let invoker = self.require_invoker()?;
        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem: subsystem.to_string(),
            operation: Operation::OneWay { payload },
        };
        invoker.invoke_oneway(request)
    }

    /// Registers a callback listener with a server subsystem.
    ///
    /// In pull mode the server queues callbacks until
    /// [`poll_callbacks`](Self::poll_callbacks). In push mode the delivery
    /// channel depends on the transport: `bisocket` clients receive pushes
    /// over their control connections and never open a listening socket,
    /// while plain `socket` clients stand up a loopback callback receiver
    /// the server connects back to.
    ///
    /// # Errors
    ///
    /// Push registration fails on a plain socket transport configured
    /// `callbackServerOnly=true`, since such a connector may not listen.
    pub fn add_listener(
        &self,
        subsystem: &str,
        handler: Arc<dyn InvokerCallbackHandler>,
        mode: CallbackMode,
    ) -> Result<ListenerId, BackhaulError> {
        let invoker = self.require_invoker()?;
        let listener_id = ListenerId::next();

        let callback_locator = match mode {
            CallbackMode::Pull => None,
            CallbackMode::Push if self.locator.transport() == "bisocket" => {
                let endpoint = self.ensure_callback_endpoint(&invoker)?;
                endpoint.register_handler(listener_id, handler);
                None
            }
            CallbackMode::Push => {
                if self.locator.callback_server_only() {
                    return Err(BackhaulError::Configuration {
                        message: "push mode needs a listening socket, but this connector is \
                                  callback-server-only; use pull mode or a bisocket locator"
                            .to_string(),
                    });
                }
                let (port, receiver) = self.ensure_callback_server(subsystem)?;
                receiver.register(listener_id, handler);
                Some(format!("socket://127.0.0.1:{port}/"))
            }
        };

        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem: subsystem.to_string(),
            operation: Operation::AddListener {
                listener_id,
                mode,
                callback_locator,
            },
        };
        let response = invoker.invoke(request)?;
        Self::expect_ack(response.body)?;

        self.listeners.lock().insert(
            listener_id,
            RegisteredListener {
                subsystem: subsystem.to_string(),
                mode,
            },
        );
        Ok(listener_id)
    }

    /// Unregisters a previously added listener.
    ///
    /// # Errors
    ///
    /// A transport failure, or a fault if the server no longer knows the
    /// listener.
    pub fn remove_listener(&self, listener_id: ListenerId) -> Result<(), BackhaulError> {
        let invoker = self.require_invoker()?;
        let Some(listener) = self.listeners.lock().remove(&listener_id) else {
            return Err(BackhaulError::Configuration {
                message: format!("{listener_id} was not registered by this client"),
            });
        };

        if let Some(endpoint) = self.callback_endpoint.lock().as_ref() {
            endpoint.unregister_handler(listener_id);
        }
        if let Some((_, receiver)) = self.callback_server.lock().as_ref() {
            receiver.unregister(listener_id);
        }

        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem: listener.subsystem,
            operation: Operation::RemoveListener { listener_id },
        };
        let response = invoker.invoke(request)?;
        Self::expect_ack(response.body)
    }

    /// Drains a pull-mode listener's pending callbacks in FIFO order.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke).
    pub fn poll_callbacks(&self, listener_id: ListenerId) -> Result<Vec<Callback>, BackhaulError> {
        self.poll_callbacks_inner(listener_id, false)
            .map(|(callbacks, _)| callbacks)
    }

    /// Drains pending callbacks and reports delivery statistics.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke).
    pub fn poll_callbacks_with_statistics(
        &self,
        listener_id: ListenerId,
    ) -> Result<(Vec<Callback>, Option<DeliveryStatistics>), BackhaulError> {
        self.poll_callbacks_inner(listener_id, true)
    }

    /// Confirms receipt of delivered callbacks back to the server.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke).
    pub fn acknowledge(
        &self,
        listener_id: ListenerId,
        callback_ids: Vec<CallbackId>,
    ) -> Result<(), BackhaulError> {
        let invoker = self.require_invoker()?;
        let subsystem = self.subsystem_of(listener_id)?;
        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem,
            operation: Operation::Acknowledge {
                listener_id,
                callback_ids,
            },
        };
        let response = invoker.invoke(request)?;
        Self::expect_ack(response.body)
    }

    /// Registers an observer for server failure, starting the connection
    /// validator if this handle is connected.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionFailureListener>) {
        self.failure_listeners.lock().push(listener);
        if let Some(invoker) = self.invoker.lock().as_ref() {
            self.start_validator(invoker);
        }
    }

    fn start_validator(&self, invoker: &Arc<SocketClientInvoker>) {
        let mut validator = self.validator.lock();
        if validator.is_some() {
            return;
        }
        *validator = Some(ConnectionValidator::start(
            invoker.clone(),
            self.locator.validator_ping_period(),
            self.locator.validator_ping_timeout(),
            self.failure_hook(),
        ));
    }

    fn failure_hook(&self) -> pinger::FailureHook {
        let listeners = self.failure_listeners.clone();
        let locator = self.locator.clone();
        Arc::new(move |error| {
            for listener in listeners.lock().iter() {
                listener.connection_failed(&locator, error);
            }
        })
    }

    fn poll_callbacks_inner(
        &self,
        listener_id: ListenerId,
        include_statistics: bool,
    ) -> Result<(Vec<Callback>, Option<DeliveryStatistics>), BackhaulError> {
        let invoker = self.require_invoker()?;
        let subsystem = self.subsystem_of(listener_id)?;
        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem,
            operation: Operation::PollCallbacks {
                listener_id,
                include_statistics,
            },
        };
        let response = invoker.invoke(request)?;
        match response.body {
            ResponseBody::Callbacks {
                callbacks,
                statistics,
            } => Ok((callbacks, statistics)),
            ResponseBody::Fault(message) => Err(BackhaulError::Invocation { message }),
            other => Err(BackhaulError::Invocation {
                message: format!("unexpected poll response: {other:?}"),
            }),
        }
    }

    fn subsystem_of(&self, listener_id: ListenerId) -> Result<String, BackhaulError> {
        self.listeners
            .lock()
            .get(&listener_id)
            .map(|listener| listener.subsystem.clone())
            .ok_or_else(|| BackhaulError::Configuration {
                message: format!("{listener_id} was not registered by this client"),
            })
    }

    fn require_invoker(&self) -> Result<Arc<SocketClientInvoker>, BackhaulError> {
        self.invoker
            .lock()
            .clone()
            .ok_or_else(|| BackhaulError::InvalidState {
                message: "client is not connected".to_string(),
            })
    }

    fn ensure_callback_endpoint(
        &self,
        invoker: &Arc<SocketClientInvoker>,
    ) -> Result<Arc<CallbackEndpoint>, BackhaulError> {
        let mut guard = self.callback_endpoint.lock();
        if let Some(endpoint) = guard.as_ref() {
            return Ok(endpoint.clone());
        }
        let request = InvocationRequest {
            session_id: invoker.session_id().clone(),
            subsystem: PING_SUBSYSTEM.to_string(),
            operation: Operation::GetSecondaryPort,
        };
        let response = invoker.invoke(request)?;
        let port = match response.body {
            ResponseBody::SecondaryPort(port) => port,
            ResponseBody::Fault(message) => return Err(BackhaulError::Invocation { message }),
            other => {
                return Err(BackhaulError::Invocation {
                    message: format!("unexpected secondary-port response: {other:?}"),
                })
            }
        };
        let endpoint = CallbackEndpoint::start(
            self.locator.clone(),
            invoker.session_id().clone(),
            port,
        )?;
        *guard = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn ensure_callback_server(
        &self,
        subsystem: &str,
    ) -> Result<(u16, Arc<CallbackReceiverHandler>), BackhaulError> {
        let mut guard = self.callback_server.lock();
        if guard.is_none() {
            let locator = InvokerLocator::new(
                "socket",
                "127.0.0.1",
                0,
                "",
                BTreeMap::from([(
                    crate::locator::params::TIMEOUT.to_string(),
                    self.locator.timeout().as_millis().to_string(),
                )]),
            );
            let server = SocketServerInvoker::new(locator);
            server.start()?;
            *guard = Some((server, Arc::new(CallbackReceiverHandler::default())));
        }
        let (server, receiver) = guard.as_ref().expect("callback server just ensured");
        // The pushed invocation names the origin subsystem; route it to the
        // shared receiver.
        server.register_handler(subsystem, receiver.clone())?;
        let port = server
            .bound_addr()
            .map(|addr| addr.port())
            .ok_or_else(|| BackhaulError::InvalidState {
                message: "callback receiver has no bound address".to_string(),
            })?;
        Ok((port, receiver.clone()))
    }

    fn unwrap_value(body: ResponseBody) -> Result<Payload, BackhaulError> {
        match body {
            ResponseBody::Value(payload) => Ok(payload),
            ResponseBody::Ack => Ok(Payload::Null),
            ResponseBody::Fault(message) => Err(BackhaulError::Invocation { message }),
            other => Err(BackhaulError::Invocation {
                message: format!("unexpected response: {other:?}"),
            }),
        }
    }

    fn expect_ack(body: ResponseBody) -> Result<(), BackhaulError> {
        match body {
            ResponseBody::Ack | ResponseBody::Value(_) => Ok(()),
            ResponseBody::Fault(message) => Err(BackhaulError::Invocation { message }),
            other => Err(BackhaulError::Invocation {
                message: format!("unexpected response: {other:?}"),
            }),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!(locator = %self.locator, "client dropped while connected, disconnecting");
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bisocket::BisocketServerInvoker;
    use crate::callback::CallbackDispatcher;
    use crate::handler::HandleCallbackError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Echo;

    impl ServerInvocationHandler for Echo {
        fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
            match request.operation.payload() {
                Some(payload) => Ok(payload.clone()),
                None => Err(InvocationFault::new("no payload")),
            }
        }
    }

    /// Fans every `Call` payload out to registered listeners as a callback.
    #[derive(Default)]
    struct Notifier {
        dispatchers: Mutex<Vec<Arc<CallbackDispatcher>>>,
    }

    impl ServerInvocationHandler for Notifier {
        fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault> {
            let payload = request.operation.payload().cloned().unwrap_or(Payload::Null);
            for dispatcher in self.dispatchers.lock().iter() {
                let _ = dispatcher.handle_callback(payload.clone());
            }
            Ok(Payload::Null)
        }

        fn add_listener(&self, dispatcher: Arc<CallbackDispatcher>) {
            self.dispatchers.lock().push(dispatcher);
        }

        fn remove_listener(&self, listener_id: ListenerId) {
            self.dispatchers
                .lock()
                .retain(|dispatcher| dispatcher.listener_id() != listener_id);
        }
    }

    struct CollectingHandler {
        received: Mutex<Vec<i64>>,
        count: AtomicUsize,
    }

    impl CollectingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }
    }

    impl InvokerCallbackHandler for Arc<CollectingHandler> {
        fn handle_callback(&self, callback: Callback) -> Result<(), HandleCallbackError> {
            if let Some(value) = callback.payload.as_i64() {
                self.received.lock().push(value);
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start_socket_server(query: &str) -> (SocketServerInvoker, InvokerLocator) {
        let locator =
            InvokerLocator::parse(&format!("socket://127.0.0.1:0/?{query}")).unwrap();
        let server = SocketServerInvoker::new(locator);
        server.register_handler("echo", Arc::new(Echo)).unwrap();
        server
            .register_handler("events", Arc::new(Notifier::default()))
            .unwrap();
        server.start().unwrap();
        let port = server.bound_addr().unwrap().port();
        let client_locator =
            InvokerLocator::parse(&format!("socket://127.0.0.1:{port}/?{query}")).unwrap();
        (server, client_locator)
    }

    #[test]
    fn test_connect_invoke_disconnect() {
        let (server, locator) = start_socket_server("timeout=3000");
        let registry = Arc::new(InvokerRegistry::new());

        let client = Client::new(registry.clone(), locator);
        client.connect().unwrap();
        let reply = client
            .invoke("echo", serde_json::json!({"n": 41}))
            .unwrap();
        assert_eq!(reply, serde_json::json!({"n": 41}));

        // Application faults arrive typed.
        let fault = client.invoke("missing", Payload::Null).unwrap_err();
        assert!(matches!(fault, BackhaulError::Invocation { .. }));

        client.disconnect();
        assert_eq!(registry.invoker_count(), 0);
        server.stop().unwrap();
    }

    #[test]
    fn test_handles_share_invoker_until_last_disconnect() {
        let (server, locator) = start_socket_server("timeout=3000");
        let registry = Arc::new(InvokerRegistry::new());

        let first = Client::new(registry.clone(), locator.clone());
        let second = Client::new(registry.clone(), locator.clone());
        first.connect().unwrap();
        second.connect().unwrap();
        assert_eq!(registry.invoker_count(), 1);
        assert_eq!(registry.ref_count(&locator), 2);

        first.disconnect();
        assert_eq!(registry.invoker_count(), 1);
        // The surviving handle still works.
        second.invoke("echo", Payload::from(1)).unwrap();

        second.disconnect();
        assert_eq!(registry.invoker_count(), 0);
        server.stop().unwrap();
    }

    #[test]
    fn test_pull_callbacks_with_statistics_and_ack() {
        let (server, locator) = start_socket_server("timeout=3000");
        let registry = Arc::new(InvokerRegistry::new());
        let client = Client::new(registry, locator);
        client.connect().unwrap();

        let handler = CollectingHandler::new();
        let listener_id = client
            .add_listener("events", Arc::new(handler), CallbackMode::Pull)
            .unwrap();

        for i in 0..3 {
            client.invoke("events", Payload::from(i)).unwrap();
        }

        let (callbacks, statistics) =
            client.poll_callbacks_with_statistics(listener_id).unwrap();
        let values: Vec<i64> = callbacks
            .iter()
            .map(|cb| cb.payload.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(statistics.unwrap().delivered, 3);

        let ids: Vec<CallbackId> = callbacks
            .iter()
            .filter_map(|cb| cb.metadata.map(|m| m.callback_id))
            .collect();
        assert_eq!(ids.len(), 3);
        client.acknowledge(listener_id, ids).unwrap();

        client.remove_listener(listener_id).unwrap();
        client.disconnect();
        server.stop().unwrap();
    }

    #[test]
    fn test_push_callbacks_over_direct_socket() {
        let (server, locator) = start_socket_server("timeout=3000");
        let registry = Arc::new(InvokerRegistry::new());
        let client = Client::new(registry, locator);
        client.connect().unwrap();

        let handler = CollectingHandler::new();
        let _listener_id = client
            .add_listener("events", Arc::new(handler.clone()), CallbackMode::Push)
            .unwrap();

        for i in 10..13 {
            client.invoke("events", Payload::from(i)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while handler.count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(*handler.received.lock(), vec![10, 11, 12]);

        client.disconnect();
        server.stop().unwrap();
    }

    #[test]
    fn test_push_callbacks_over_bisocket_control_connections() {
        let locator = InvokerLocator::parse("bisocket://127.0.0.1:0/?timeout=3000").unwrap();
        let server = BisocketServerInvoker::new(locator);
        server
            .register_handler("events", Arc::new(Notifier::default()))
            .unwrap();
        server.start().unwrap();
        let port = server.bound_addr().unwrap().port();

        let client_locator = InvokerLocator::parse(&format!(
            "bisocket://127.0.0.1:{port}/?timeout=3000&minControlConnections=2"
        ))
        .unwrap();
        let registry = Arc::new(InvokerRegistry::new());
        let client = Client::new(registry, client_locator);
        client.connect().unwrap();

        let handler = CollectingHandler::new();
        let _listener_id = client
            .add_listener("events", Arc::new(handler.clone()), CallbackMode::Push)
            .unwrap();

        // Give the endpoint a beat to stand up its control connections.
        let deadline = Instant::now() + Duration::from_secs(3);
        while server
            .control_pools()
            .pool(&client.session_id().unwrap())
            .map(|pool| pool.is_empty())
            .unwrap_or(true)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(20));
        }

        for i in 20..24 {
            client.invoke("events", Payload::from(i)).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while handler.count.load(Ordering::SeqCst) < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(*handler.received.lock(), vec![20, 21, 22, 23]);

        client.disconnect();
        server.stop().unwrap();
        server.destroy();
    }

    #[test]
    fn test_lease_keeps_session_alive_on_server() {
        let (server, locator) = start_socket_server("timeout=3000");
        let leased = locator
            .with_parameter("enableLease", "true")
            .with_parameter("leasePeriod", "400");
        let registry = Arc::new(InvokerRegistry::new());
        let client = Client::new(registry, leased);
        client.connect().unwrap();
        let session = client.session_id().unwrap();

        // The first ping establishes the lease promptly.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !server.leases().is_leased(&session) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(server.leases().is_leased(&session));
        let (invoked, succeeded) = client.lease_ping_status().unwrap();
        assert!(invoked);
        assert!(succeeded);

        // Renewals outpace the period; the lease survives several windows.
        thread::sleep(Duration::from_millis(1_000));
        assert!(server.leases().is_leased(&session));

        client.disconnect();
        server.stop().unwrap();
    }
}
