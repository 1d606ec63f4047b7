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

//! Memory-bounded callback spooling.

use crate::callback::CallbackError;
use crate::invocation::Callback;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::debug;

/// Fixed bookkeeping overhead charged per stored callback, on top of its
/// serialized payload size.
const PER_ENTRY_OVERHEAD: usize = 64;

/// Estimates the memory footprint of one stored callback.
///
/// The estimate is the callback's serialized size plus a fixed overhead; it
/// only needs to be consistent, not exact, since the ceiling it feeds is a
/// backpressure threshold rather than an allocation limit.
#[must_use]
pub fn estimate_size(callback: &Callback) -> usize {
    serde_json::to_vec(callback)
        .map(|bytes| bytes.len())
        .unwrap_or(PER_ENTRY_OVERHEAD)
        + PER_ENTRY_OVERHEAD
}

/// FIFO spool for callbacks awaiting a slow or polling consumer.
///
/// Implementations are keyed per listener. Producers may block in
/// [`add`](Self::add); consumers never observe items out of per-producer
/// generation order.
pub trait CallbackStore: Send + Sync {
    /// Enqueues a callback at the tail.
    ///
    /// Blocks the producer while the store is at its memory ceiling:
    /// backpressure, never loss.
    ///
    /// # Errors
    ///
    /// [`CallbackError::StoreClosed`] if the store closes while enqueuing
    /// or while blocked.
    fn add(&self, callback: Callback) -> Result<(), CallbackError>;

    /// Re-enqueues a callback at the head after a failed delivery attempt.
    ///
    /// The entry was already admitted once, so the ceiling does not apply;
    /// this must not block.
    ///
    /// # Errors
    ///
    /// [`CallbackError::StoreClosed`] if the store is closed.
    fn restore_front(&self, callback: Callback) -> Result<(), CallbackError>;

    /// Dequeues the head entry, if any.
    ///
    /// # Errors
    ///
    /// [`CallbackError::StoreClosed`] if the store is closed.
    fn take_one(&self) -> Result<Option<Callback>, CallbackError>;

    /// Drains every pending entry in FIFO order.
    ///
    /// # Errors
    ///
    /// [`CallbackError::StoreClosed`] if the store is closed.
    fn take_all(&self) -> Result<Vec<Callback>, CallbackError>;

    /// Number of pending entries.
    fn len(&self) -> usize;

    /// Whether the store has no pending entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes currently held.
    fn memory_used(&self) -> usize;

    /// Closes the store, waking blocked producers with
    /// [`CallbackError::StoreClosed`].
    fn close(&self);
}

struct StoreInner {
    entries: VecDeque<(Callback, usize)>,
    bytes: usize,
    closed: bool,
}

/// The default in-memory [`CallbackStore`].
///
/// Once the estimated footprint crosses the configured ceiling, further
/// [`add`](CallbackStore::add) calls park the producer until a consumer
/// drains entries: the server-side invocation generating callbacks stalls
/// instead of growing without bound. A callback larger than the entire
/// ceiling is admitted alone rather than deadlocking the producer.
pub struct InMemoryCallbackStore {
    ceiling: usize,
    inner: Mutex<StoreInner>,
    space_freed: Condvar,
}

impl InMemoryCallbackStore {
    /// Creates a store with the given memory ceiling in bytes.
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            inner: Mutex::new(StoreInner {
                entries: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            space_freed: Condvar::new(),
        }
    }
}

impl CallbackStore for InMemoryCallbackStore {
    fn add(&self, callback: Callback) -> Result<(), CallbackError> {
        let size = estimate_size(&callback);
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(CallbackError::StoreClosed);
            }
            if inner.bytes + size <= self.ceiling || inner.entries.is_empty() {
                break;
            }
            debug!(
                bytes = inner.bytes,
                ceiling = self.ceiling,
                "callback store at ceiling, blocking producer"
            );
            self.space_freed.wait(&mut inner);
        }
        inner.bytes += size;
        inner.entries.push_back((callback, size));
        Ok(())
    }

    fn restore_front(&self, callback: Callback) -> Result<(), CallbackError> {
        let size = estimate_size(&callback);
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        inner.bytes += size;
        inner.entries.push_front((callback, size));
        Ok(())
    }

    fn take_one(&self) -> Result<Option<Callback>, CallbackError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        match inner.entries.pop_front() {
            Some((callback, size)) => {
                inner.bytes -= size;
                self.space_freed.notify_all();
                Ok(Some(callback))
            }
            None => Ok(None),
        }
    }

    fn take_all(&self) -> Result<Vec<Callback>, CallbackError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        inner.bytes = 0;
        let drained = inner.entries.drain(..).map(|(cb, _)| cb).collect();
        self.space_freed.notify_all();
        Ok(drained)
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn memory_used(&self) -> usize {
        self.inner.lock().bytes
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.space_freed.notify_all();
    }
}
