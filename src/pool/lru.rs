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

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

/// What an insert does when the pool is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Park the inserting thread until another thread releases a slot.
    ///
    /// Used where blocking naturally applies backpressure, e.g. the busy
    /// connection pool throttling the accept loop.
    Block,
    /// Evict the least-recently-used entry and hand it back to the caller
    /// for disposal.
    ///
    /// Used where members are reusable but disposable, e.g. pooled client
    /// connections.
    Evict,
}

/// Errors raised by pool operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was closed while the caller was inserting or waiting.
    #[error("pool is closed")]
    Closed,

    /// The key is already present; a key has exactly one holder at a time.
    #[error("key is already pooled")]
    DuplicateKey,
}

struct Inner<K, V> {
    /// Recency order: least-recently-used at the front.
    entries: VecDeque<(K, V)>,
    closed: bool,
}

/// A bounded, keyed pool ordered by recency of use.
///
/// `size() <= capacity` holds at every observable instant. All entry and
/// exit points are mutually exclusive under a single pool lock; blocked
/// inserts release the lock while parked and re-acquire it on wake. Reading
/// an entry with [`get`](Self::get) or [`touch`](Self::touch) refreshes its
/// recency.
///
/// The pool never destroys members itself: entries leaving by eviction or
/// [`take_lru`](Self::take_lru)/[`take_mru`](Self::take_mru) are returned to
/// the caller, who is responsible for releasing them.
///
/// # Examples
///
/// ```rust
/// use backhaul::pool::{LruPool, OverflowPolicy};
///
/// let pool: LruPool<u32, &str> = LruPool::new(2, OverflowPolicy::Evict);
/// pool.insert(1, "one").unwrap();
/// pool.insert(2, "two").unwrap();
///
/// // Touching 1 makes 2 the eviction candidate.
/// pool.touch(&1);
/// let evicted = pool.insert(3, "three").unwrap();
/// assert_eq!(evicted, Some((2, "two")));
/// assert_eq!(pool.size(), 2);
/// ```
pub struct LruPool<K, V> {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<K, V>>,
    slot_freed: Condvar,
}

impl<K: Eq, V> LruPool<K, V> {
    /// Creates a pool bounded at `capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "pool capacity must be greater than zero");
        Self {
            capacity,
            policy,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            slot_freed: Condvar::new(),
        }
    }

    /// Inserts a member as the most recently used entry.
    ///
    /// At capacity, [`OverflowPolicy::Block`] parks the caller until a slot
    /// frees, and [`OverflowPolicy::Evict`] removes and returns the
    /// least-recently-used entry.
    ///
    /// # Errors
    ///
    /// [`PoolError::DuplicateKey`] if the key is already present;
    /// [`PoolError::Closed`] if the pool is closed before a slot frees.
    pub fn insert(&self, key: K, value: V) -> Result<Option<(K, V)>, PoolError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PoolError::Closed);
        }
        if inner.entries.iter().any(|(k, _)| *k == key) {
            return Err(PoolError::DuplicateKey);
        }

        let mut evicted = None;
        while inner.entries.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::Evict => {
                    evicted = inner.entries.pop_front();
                }
                OverflowPolicy::Block => {
                    self.slot_freed.wait(&mut inner);
                    if inner.closed {
                        return Err(PoolError::Closed);
                    }
                }
            }
        }

        inner.entries.push_back((key, value));
        Ok(evicted)
    }

    /// Removes a member by key, freeing its slot.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|(k, _)| k == key)?;
        let (_, value) = inner.entries.remove(index)?;
        self.slot_freed.notify_all();
        Some(value)
    }

    /// Refreshes a member's recency. Returns whether the key was present.
    pub fn touch(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.entries.iter().position(|(k, _)| k == key) {
            if let Some(entry) = inner.entries.remove(index) {
                inner.entries.push_back(entry);
                return true;
            }
        }
        false
    }

    /// Removes and returns the least-recently-used member.
    pub fn take_lru(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_front();
        if entry.is_some() {
            self.slot_freed.notify_all();
        }
        entry
    }

    /// Removes and returns the most-recently-used member.
    pub fn take_mru(&self) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop_back();
        if entry.is_some() {
            self.slot_freed.notify_all();
        }
        entry
    }

    /// Explicitly evicts the least-recently-used member.
    ///
    /// Identical to [`take_lru`](Self::take_lru); the caller destroys the
    /// returned member.
    pub fn evict_lru(&self) -> Option<(K, V)> {
        self.take_lru()
    }

    /// Whether the key is currently pooled.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.iter().any(|(k, _)| k == key)
    }

    /// Current member count.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The configured capacity bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Parks the caller until the pool is below capacity, a timeout elapses,
    /// or the pool closes.
    ///
    /// Returns `true` if the pool is below capacity on return.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] if the pool closes while waiting.
    pub fn wait_below_capacity(&self, timeout: Option<Duration>) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        while inner.entries.len() >= self.capacity {
            if inner.closed {
                return Err(PoolError::Closed);
            }
            match timeout {
                Some(duration) => {
                    if self.slot_freed.wait_for(&mut inner, duration).timed_out() {
                        return Ok(inner.entries.len() < self.capacity);
                    }
                }
                None => self.slot_freed.wait(&mut inner),
            }
        }
        if inner.closed {
            return Err(PoolError::Closed);
        }
        Ok(true)
    }

    /// Closes the pool: wakes every parked inserter with
    /// [`PoolError::Closed`] and rejects further inserts. Existing members
    /// stay until drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.slot_freed.notify_all();
    }

    /// Drains every member, in least-recently-used order first.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut inner = self.inner.lock();
        let drained = inner.entries.drain(..).collect();
        self.slot_freed.notify_all();
        drained
    }
}

impl<K: Eq, V: Clone> LruPool<K, V> {
    /// Returns a clone of a member's value, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|(k, _)| k == key)?;
        let entry = inner.entries.remove(index)?;
        let value = entry.1.clone();
        inner.entries.push_back(entry);
        Some(value)
    }
}
