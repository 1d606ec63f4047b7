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

//! Per-listener delivery dispatching.
//!
//! A dispatcher is the server-side representation of one registered
//! listener. The delivery mode and channel are fixed at registration; the
//! generating handler only ever calls
//! [`handle_callback`](CallbackDispatcher::handle_callback) and the runtime
//! routes the rest.

use crate::callback::{CallbackError, CallbackStore};
use crate::invocation::{
    Callback, CallbackId, CallbackMetadata, CallbackMode, DeliveryStatistics, InvocationRequest,
    ListenerId, Operation, Payload, SessionId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Delivery channel for push-mode callbacks.
///
/// Implemented over an ordinary socket (the server invokes the client's
/// callback receiver directly) and over bisocket control connections. The
/// dispatcher neither knows nor cares which; it hands the sink a fully
/// formed delivery request.
pub trait CallbackSink: Send + Sync {
    /// Delivers one callback exchange and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// A [`CallbackError`] if the delivery could not be completed; the
    /// dispatcher keeps the callback queued for ordered redelivery.
    fn deliver(&self, request: &InvocationRequest) -> Result<(), CallbackError>;
}

/// Server-side handler object for one registered callback listener.
///
/// Guarantees per-listener generation order: push deliveries are serialized
/// under a delivery lock, and once a push fails the callback (and everything
/// generated after it) detours through the listener's store until the store
/// drains, so a slow or flaky channel can never reorder deliveries.
pub struct CallbackDispatcher {
    listener_id: ListenerId,
    session_id: SessionId,
    subsystem: String,
    origin: Option<String>,
    mode: CallbackMode,
    sink: Option<Box<dyn CallbackSink>>,
    store: Box<dyn CallbackStore>,
    /// Serializes push attempts so generation order survives concurrent
    /// producers.
    delivery: Mutex<()>,
    next_callback: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
}

impl CallbackDispatcher {
    /// Creates a pull-mode dispatcher: every callback waits in `store`
    /// until the client polls.
    pub fn pull(
        listener_id: ListenerId,
        session_id: SessionId,
        subsystem: impl Into<String>,
        origin: Option<String>,
        store: Box<dyn CallbackStore>,
    ) -> Self {
        Self {
            listener_id,
            session_id,
            subsystem: subsystem.into(),
            origin,
            mode: CallbackMode::Pull,
            sink: None,
            store,
            delivery: Mutex::new(()),
            next_callback: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Creates a push-mode dispatcher delivering over `sink`, with `store`
    /// as the ordered spillover for failed deliveries.
    pub fn push(
        listener_id: ListenerId,
        session_id: SessionId,
        subsystem: impl Into<String>,
        origin: Option<String>,
        sink: Box<dyn CallbackSink>,
        store: Box<dyn CallbackStore>,
    ) -> Self {
        Self {
            listener_id,
            session_id,
            subsystem: subsystem.into(),
            origin,
            mode: CallbackMode::Push,
            sink: Some(sink),
            store,
            delivery: Mutex::new(()),
            next_callback: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// The listener this dispatcher represents.
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// The session the listener belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The negotiated delivery mode.
    pub fn mode(&self) -> CallbackMode {
        self.mode
    }

    fn stamp(&self, payload: Payload) -> Callback {
        Callback {
            payload,
            origin: self.origin.clone(),
            metadata: Some(CallbackMetadata {
                listener_id: self.listener_id,
                callback_id: CallbackId::new(self.next_callback.fetch_add(1, Ordering::Relaxed)),
            }),
        }
    }

    /// Accepts one callback from the generating handler and delivers or
    /// queues it according to the listener's mode.
    ///
    /// May block: a pull-mode (or spilled-over push-mode) enqueue applies
    /// the store's memory-ceiling backpressure to the calling thread.
    ///
    /// # Errors
    ///
    /// A push failure is reported to the caller as
    /// [`CallbackError::DeliveryFailed`]; the callback itself remains
    /// queued and is redelivered in generation order.
    pub fn handle_callback(&self, payload: Payload) -> Result<(), CallbackError> {
        let callback = self.stamp(payload);
        match self.mode {
            CallbackMode::Pull => self.store.add(callback),
            CallbackMode::Push => self.push_ordered(callback),
        }
    }

    fn push_ordered(&self, callback: Callback) -> Result<(), CallbackError> {
        let _guard = self.delivery.lock();

        // Drain earlier spillover first; delivering the new callback ahead
        // of it would break generation order.
        while let Some(waiting) = self.store.take_one()? {
            if let Err(error) = self.push_one(&waiting) {
                self.store.restore_front(waiting)?;
                self.store.add(callback)?;
                return Err(error);
            }
        }

        match self.push_one(&callback) {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(
                    listener = %self.listener_id,
                    error = %error,
                    "push failed, queuing callback for ordered redelivery"
                );
                self.store.add(callback)?;
                Err(error)
            }
        }
    }

    fn push_one(&self, callback: &Callback) -> Result<(), CallbackError> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| CallbackError::DeliveryFailed {
                listener_id: self.listener_id,
                reason: "listener has no push channel".to_string(),
            })?;
        let request = InvocationRequest {
            session_id: self.session_id.clone(),
            subsystem: self.subsystem.clone(),
            operation: Operation::DeliverCallback {
                callback: callback.clone(),
            },
        };
        sink.deliver(&request)?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drains pending callbacks for a client poll, FIFO.
    ///
    /// # Errors
    ///
    /// A [`CallbackError`] if the store has been closed.
    pub fn poll(
        &self,
        include_statistics: bool,
    ) -> Result<(Vec<Callback>, Option<DeliveryStatistics>), CallbackError> {
        let drained = self.store.take_all()?;
        self.delivered
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        debug!(listener = %self.listener_id, drained = drained.len(), "poll drained callbacks");
        let statistics = include_statistics.then(|| self.statistics());
        Ok((drained, statistics))
    }

    /// Records client acknowledgements for previously delivered callbacks.
    pub fn acknowledge(&self, callback_ids: &[CallbackId]) {
        self.acknowledged
            .fetch_add(callback_ids.len() as u64, Ordering::Relaxed);
    }

    /// Current delivery statistics for this listener.
    pub fn statistics(&self) -> DeliveryStatistics {
        DeliveryStatistics {
            delivered: self.delivered.load(Ordering::Relaxed),
            pending: self.store.len() as u64,
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
        }
    }

    /// Closes the underlying store, waking any blocked producer.
    pub fn close(&self) {
        self.store.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::InMemoryCallbackStore;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Sink recording delivered payload values, failing while `broken`.
    struct RecordingSink {
        broken: AtomicBool,
        seen: Mutex<Vec<i64>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                broken: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl CallbackSink for Arc<RecordingSink> {
        fn deliver(&self, request: &InvocationRequest) -> Result<(), CallbackError> {
            let Operation::DeliverCallback { callback } = &request.operation else {
                panic!("sink received a non-delivery operation");
            };
            if self.broken.load(Ordering::SeqCst) {
                return Err(CallbackError::DeliveryFailed {
                    listener_id: ListenerId::from(0),
                    reason: "sink offline".to_string(),
                });
            }
            self.seen.lock().push(callback.payload.as_i64().unwrap());
            Ok(())
        }
    }

    fn push_dispatcher(sink: Arc<RecordingSink>) -> CallbackDispatcher {
        CallbackDispatcher::push(
            ListenerId::next(),
            SessionId::generate(),
            "events",
            Some("socket://127.0.0.1:1/".to_string()),
            Box::new(sink),
            Box::new(InMemoryCallbackStore::new(1 << 20)),
        )
    }

    #[test]
    fn test_pull_mode_queues_until_polled() {
        let dispatcher = CallbackDispatcher::pull(
            ListenerId::next(),
            SessionId::generate(),
            "events",
            None,
            Box::new(InMemoryCallbackStore::new(1 << 20)),
        );
        dispatcher.handle_callback(Payload::from(1)).unwrap();
        dispatcher.handle_callback(Payload::from(2)).unwrap();

        let (callbacks, statistics) = dispatcher.poll(true).unwrap();
        let values: Vec<i64> = callbacks
            .iter()
            .map(|cb| cb.payload.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2]);
        let statistics = statistics.unwrap();
        assert_eq!(statistics.delivered, 2);
        assert_eq!(statistics.pending, 0);
    }

    #[test]
    fn test_push_mode_delivers_immediately() {
        let sink = RecordingSink::new();
        let dispatcher = push_dispatcher(sink.clone());
        dispatcher.handle_callback(Payload::from(7)).unwrap();
        assert_eq!(*sink.seen.lock(), vec![7]);
        assert_eq!(dispatcher.statistics().delivered, 1);
    }

    #[test]
    fn test_generation_order_survives_push_failures() {
        let sink = RecordingSink::new();
        let dispatcher = push_dispatcher(sink.clone());

        dispatcher.handle_callback(Payload::from(1)).unwrap();

        // Channel breaks: 2 and 3 spill into the store, errors reported.
        sink.broken.store(true, Ordering::SeqCst);
        assert!(dispatcher.handle_callback(Payload::from(2)).is_err());
        assert!(dispatcher.handle_callback(Payload::from(3)).is_err());
        assert_eq!(dispatcher.statistics().pending, 2);

        // Channel heals: the next delivery drains spillover first.
        sink.broken.store(false, Ordering::SeqCst);
        dispatcher.handle_callback(Payload::from(4)).unwrap();

        assert_eq!(*sink.seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(dispatcher.statistics().pending, 0);
    }

    #[test]
    fn test_callback_metadata_is_sequential() {
        let sink = RecordingSink::new();
        let dispatcher = push_dispatcher(sink);
        dispatcher.handle_callback(Payload::from(1)).unwrap();
        dispatcher.handle_callback(Payload::from(2)).unwrap();
        // Sequence numbers continue through the acknowledgement counter.
        dispatcher.acknowledge(&[CallbackId::new(1), CallbackId::new(2)]);
        let statistics = dispatcher.statistics();
        assert_eq!(statistics.acknowledged, 2);
        assert_eq!(statistics.delivered, 2);
    }
}
