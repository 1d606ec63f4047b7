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

//! Application-facing capability traits.
//!
//! These are the seams between the runtime and application code: servers
//! implement [`ServerInvocationHandler`] per subsystem, clients implement
//! [`InvokerCallbackHandler`] to receive pushed callbacks, and either side
//! registers failure listeners to observe dead peers. Each trait has a
//! small, fixed method set so transports and tests can substitute
//! implementations freely.

use crate::callback::CallbackDispatcher;
use crate::invocation::{Callback, InvocationRequest, ListenerId, Payload, SessionId};
use crate::locator::InvokerLocator;
use crate::transport::TransportError;
use std::sync::Arc;
use thiserror::Error;

/// An application-level failure raised by a subsystem handler.
///
/// Faults propagate to the remote caller verbatim; they are the RPC
/// equivalent of a thrown application exception, distinct from every
/// transport-level condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct InvocationFault {
    /// Human-readable failure description, delivered to the caller.
    pub message: String,
}

impl InvocationFault {
    /// Creates a fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A client-side callback handler failed to process a delivered callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("callback handler failed: {message}")]
pub struct HandleCallbackError {
    /// Human-readable failure description.
    pub message: String,
}

impl HandleCallbackError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Server-side entry point for one named subsystem.
///
/// Registered with a server invoker under a subsystem name; every `Call` or
/// `OneWay` operation addressed to that name lands in
/// [`invoke`](Self::invoke) on a pooled worker thread, so implementations
/// must be `Send + Sync` and may block.
///
/// Listener management is delegated to the handler so it can decide when to
/// generate callbacks: the runtime constructs a [`CallbackDispatcher`] per
/// registered listener and hands it over; the handler calls
/// [`CallbackDispatcher::handle_callback`] whenever it has something to
/// deliver.
pub trait ServerInvocationHandler: Send + Sync {
    /// Handles one application invocation and returns its result payload.
    ///
    /// # Errors
    ///
    /// An [`InvocationFault`] propagates to the remote caller as an
    /// application-level failure.
    fn invoke(&self, request: &InvocationRequest) -> Result<Payload, InvocationFault>;

    /// A callback listener registered for this subsystem.
    ///
    /// The default implementation drops the dispatcher, for subsystems that
    /// never generate callbacks.
    fn add_listener(&self, dispatcher: Arc<CallbackDispatcher>) {
        let _ = dispatcher;
    }

    /// A previously registered listener was removed or its session expired.
    fn remove_listener(&self, listener_id: ListenerId) {
        let _ = listener_id;
    }

    /// Lifecycle hook: the handler was registered with a server invoker.
    ///
    /// `locator` is the owning invoker's endpoint, e.g. for stamping
    /// callback origins or registering with a management layer.
    fn on_registered(&self, locator: &InvokerLocator) {
        let _ = locator;
    }

    /// Lifecycle hook: the owning invoker is being destroyed.
    fn on_unregistered(&self) {}
}

/// Client-side receiver for pushed callbacks.
pub trait InvokerCallbackHandler: Send + Sync {
    /// Handles one delivered callback.
    ///
    /// # Errors
    ///
    /// A [`HandleCallbackError`] is reported back to the delivering server
    /// as a failed delivery.
    fn handle_callback(&self, callback: Callback) -> Result<(), HandleCallbackError>;
}

/// Client-side observer of a dead or unreachable server.
///
/// Registered on a [`Client`](crate::client::Client); invoked by the
/// connection validator (and by lease-ping failures) on a probe thread,
/// never from an application invocation.
pub trait ConnectionFailureListener: Send + Sync {
    /// The server behind `locator` stopped answering probes.
    fn connection_failed(&self, locator: &InvokerLocator, error: &TransportError);
}

/// Server-side observer of expired client sessions.
///
/// Invoked by the lease reaper when a session misses its renewal window.
pub trait ConnectionListener: Send + Sync {
    /// The client owning `session_id` is considered gone.
    fn connection_terminated(&self, session_id: &SessionId);
}
