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

//! Wire-level invocation model.
//!
//! Every exchange between peers is one [`WireMessage`]: a framed
//! [`InvocationRequest`] answered by a framed [`InvocationResponse`] on the
//! same connection. Requests name a server subsystem and carry an
//! [`Operation`]; responses carry a [`ResponseBody`]. The model is
//! codec-neutral: the [`marshal`](crate::marshal) layer decides how it is
//! encoded on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Reserved subsystem for lease and validator probes.
///
/// Application subsystems must never use this name; registration rejects it.
pub const PING_SUBSYSTEM: &str = "$PING$";

/// Application payloads travel as self-describing JSON values so any codec
/// the [`marshal`](crate::marshal) layer selects can carry them.
pub type Payload = serde_json::Value;

/// Identity of one client session.
///
/// A session groups every connection, lease, and callback listener a single
/// client invoker owns. Identities must not collide across processes, so
/// they are random rather than counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a fresh, process-unique session identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one registered callback listener, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    /// Creates the next process-unique listener identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The identity as a raw integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ListenerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Identity of one generated callback, unique within a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The identity as a raw integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback-{}", self.0)
    }
}

/// Delivery mode negotiated when a listener registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackMode {
    /// The server delivers each callback immediately over a callback channel.
    Push,
    /// The server queues callbacks until the client polls for them.
    Pull,
}

/// Lease terms carried by a lease-renewing ping.
///
/// Validator probes omit this; they share the `$PING$` subsystem but carry
/// no lease semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Lease period in milliseconds; the session expires if no renewal
    /// arrives within this window.
    pub period_ms: u64,
}

/// Acknowledgement metadata attached to a delivered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackMetadata {
    /// The listener the callback was generated for.
    pub listener_id: ListenerId,
    /// The callback's position in that listener's generation order.
    pub callback_id: CallbackId,
}

/// An asynchronous notification generated server-side for one listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    /// Application payload.
    pub payload: Payload,
    /// Locator string of the server that generated the callback.
    pub origin: Option<String>,
    /// Acknowledgement metadata, present on every tracked delivery.
    pub metadata: Option<CallbackMetadata>,
}

/// Delivery statistics reported alongside a poll when requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatistics {
    /// Callbacks handed to the listener so far, by push or poll.
    pub delivered: u64,
    /// Callbacks still waiting in the store.
    pub pending: u64,
    /// Callbacks the client has acknowledged.
    pub acknowledged: u64,
}

/// The operation a request asks the server to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Synchronous application invocation; the worker writes a response.
    Call {
        /// Application payload handed to the subsystem handler.
        payload: Payload,
    },
    /// Fire-and-forget application invocation; no response is written.
    OneWay {
        /// Application payload handed to the subsystem handler.
        payload: Payload,
    },
    /// Liveness probe, optionally renewing a session lease.
    Ping {
        /// Lease terms; absent on validator probes.
        lease: Option<LeaseRequest>,
    },
    /// Register a callback listener with the subsystem handler.
    AddListener {
        /// Client-chosen listener identity.
        listener_id: ListenerId,
        /// Push or pull delivery.
        mode: CallbackMode,
        /// Locator of a client-side callback receiver for direct push;
        /// absent when pushes ride bisocket control connections.
        callback_locator: Option<String>,
    },
    /// Unregister a callback listener.
    RemoveListener {
        /// The listener to remove.
        listener_id: ListenerId,
    },
    /// Drain a pull-mode listener's pending callbacks in FIFO order.
    PollCallbacks {
        /// The listener to drain.
        listener_id: ListenerId,
        /// Also report [`DeliveryStatistics`].
        include_statistics: bool,
    },
    /// Confirm receipt of previously delivered callbacks.
    Acknowledge {
        /// The listener the callbacks belong to.
        listener_id: ListenerId,
        /// The callbacks being confirmed.
        callback_ids: Vec<CallbackId>,
    },
    /// Server-to-client delivery of one callback (push path).
    DeliverCallback {
        /// The callback being delivered.
        callback: Callback,
    },
    /// First frame on a bisocket control connection, binding it to a session.
    RegisterControl,
    /// Ask a bisocket server for its secondary (control) listener port.
    GetSecondaryPort,
}

impl Operation {
    /// The application payload, for operations that carry one.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Operation::Call { payload } | Operation::OneWay { payload } => Some(payload),
            _ => None,
        }
    }

    /// Whether the worker writes a response for this operation.
    #[must_use]
    pub fn expects_response(&self) -> bool {
        !matches!(self, Operation::OneWay { .. })
    }
}

/// One framed request from a client (or, on the push path, from a server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// The session the request belongs to.
    pub session_id: SessionId,
    /// The named server subsystem the request addresses.
    pub subsystem: String,
    /// What the subsystem should do.
    pub operation: Operation,
}

/// The body of an invocation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// Successful application result.
    Value(Payload),
    /// Drained callbacks answering a [`Operation::PollCallbacks`].
    Callbacks {
        /// Pending callbacks in generation order.
        callbacks: Vec<Callback>,
        /// Statistics, when the poll asked for them.
        statistics: Option<DeliveryStatistics>,
    },
    /// Secondary listener port answering [`Operation::GetSecondaryPort`].
    SecondaryPort(u16),
    /// Bare acknowledgement for operations with no result value.
    Ack,
    /// Application-level failure propagated from the handler.
    Fault(String),
}

/// One framed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Result or failure.
    pub body: ResponseBody,
}

impl InvocationResponse {
    /// A bare acknowledgement.
    #[must_use]
    pub fn ack() -> Self {
        Self {
            body: ResponseBody::Ack,
        }
    }

    /// A successful value response.
    #[must_use]
    pub fn value(payload: Payload) -> Self {
        Self {
            body: ResponseBody::Value(payload),
        }
    }

    /// An application-level failure.
    #[must_use]
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            body: ResponseBody::Fault(message.into()),
        }
    }
}

/// Either side of one wire exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// A request frame.
    Request(InvocationRequest),
    /// A response frame.
    Response(InvocationResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_listener_ids_are_monotonic() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_oneway_expects_no_response() {
        let call = Operation::Call {
            payload: Payload::Null,
        };
        let oneway = Operation::OneWay {
            payload: Payload::Null,
        };
        assert!(call.expects_response());
        assert!(!oneway.expects_response());
    }

    #[test]
    fn test_wire_message_serde_round_trip() {
        let request = WireMessage::Request(InvocationRequest {
            session_id: SessionId::generate(),
            subsystem: "inventory".to_string(),
            operation: Operation::AddListener {
                listener_id: ListenerId::from(7),
                mode: CallbackMode::Pull,
                callback_locator: None,
            },
        });
        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: WireMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(request, decoded);
    }
}
