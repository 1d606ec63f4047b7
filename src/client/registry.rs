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

//! Reference-counted deduplication of client invokers.

use crate::client::SocketClientInvoker;
use crate::locator::InvokerLocator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct RegistryEntry {
    invoker: Arc<SocketClientInvoker>,
    ref_count: usize,
}

/// Process-scoped cache of client invokers, keyed by locator signature.
///
/// Multiple logical [`Client`](crate::client::Client) handles naming the
/// same endpoint with the same configuration share one invoker (and so one
/// connection pool and session). The registry is an explicit object rather
/// than hidden static state: construct one per process in production, or
/// one per test for isolation.
///
/// Entries are created on first acquire and destroyed when the reference
/// count returns to zero.
#[derive(Default)]
pub struct InvokerRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl InvokerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared invoker for `locator`, creating it on first use.
    pub fn acquire(&self, locator: &InvokerLocator) -> Arc<SocketClientInvoker> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(locator.signature())
            .or_insert_with(|| {
                debug!(%locator, "creating shared client invoker");
                RegistryEntry {
                    invoker: Arc::new(SocketClientInvoker::new(locator.clone())),
                    ref_count: 0,
                }
            });
        entry.ref_count += 1;
        entry.invoker.clone()
    }

    /// Releases one reference to `locator`'s invoker.
    ///
    /// Returns `true` if this was the last reference, in which case the
    /// invoker has been disconnected and removed.
    pub fn release(&self, locator: &InvokerLocator) -> bool {
        let mut entries = self.entries.lock();
        let signature = locator.signature();
        let Some(entry) = entries.get_mut(&signature) else {
            return false;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return false;
        }
        let entry = entries
            .remove(&signature)
            .expect("entry present under held lock");
        drop(entries);
        debug!(%locator, "destroying shared client invoker");
        entry.invoker.disconnect();
        true
    }

    /// Number of distinct invokers currently cached.
    pub fn invoker_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current reference count for `locator`, zero if absent.
    pub fn ref_count(&self, locator: &InvokerLocator) -> usize {
        self.entries
            .lock()
            .get(&locator.signature())
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(suffix: &str) -> InvokerLocator {
        InvokerLocator::parse(&format!("socket://127.0.0.1:6500/{suffix}")).unwrap()
    }

    #[test]
    fn test_same_signature_shares_one_invoker() {
        let registry = InvokerRegistry::new();
        let first = registry.acquire(&locator("a"));
        let second = registry.acquire(&locator("a"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.invoker_count(), 1);
        assert_eq!(registry.ref_count(&locator("a")), 2);
    }

    #[test]
    fn test_different_configuration_is_a_different_invoker() {
        let registry = InvokerRegistry::new();
        let plain = registry.acquire(&locator("a"));
        let tuned = registry.acquire(&locator("a?timeout=100"));
        assert!(!Arc::ptr_eq(&plain, &tuned));
        assert_eq!(registry.invoker_count(), 2);
    }

    #[test]
    fn test_release_destroys_on_last_reference() {
        let registry = InvokerRegistry::new();
        let locator = locator("a");
        let _first = registry.acquire(&locator);
        let _second = registry.acquire(&locator);

        assert!(!registry.release(&locator));
        assert_eq!(registry.invoker_count(), 1);
        assert!(registry.release(&locator));
        assert_eq!(registry.invoker_count(), 0);
        assert_eq!(registry.ref_count(&locator), 0);
    }

    #[test]
    fn test_reacquire_after_destruction_creates_fresh_invoker() {
        let registry = InvokerRegistry::new();
        let locator = locator("a");
        let first = registry.acquire(&locator);
        registry.release(&locator);

        let second = registry.acquire(&locator);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_independent_registries_do_not_share() {
        let one = InvokerRegistry::new();
        let two = InvokerRegistry::new();
        let a = one.acquire(&locator("a"));
        let b = two.acquire(&locator("a"));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
