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

//! Server-side session leases.

use crate::handler::ConnectionListener;
use crate::invocation::SessionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct Lease {
    period: Duration,
    last_renewed: Instant,
}

/// Tracks one lease per client session that requested keep-alive.
///
/// A lease exists only while the client pings: the first `$PING$` carrying
/// lease terms creates it, every subsequent one renews it, and the server's
/// reaper tears the session down when a renewal misses its window,
/// independent of any application traffic on the session.
///
/// The registry itself is passive; the owning invoker drives
/// [`expire_overdue`](Self::expire_overdue) from its reaper thread.
#[derive(Default)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<SessionId, Lease>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl LeaseRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or renews the lease for `session`.
    pub fn renew(&self, session: SessionId, period: Duration) {
        let mut leases = self.leases.lock();
        match leases.get_mut(&session) {
            Some(lease) => {
                lease.period = period;
                lease.last_renewed = Instant::now();
            }
            None => {
                info!(%session, ?period, "lease established");
                leases.insert(
                    session,
                    Lease {
                        period,
                        last_renewed: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drops a session's lease without treating it as expired, e.g. on an
    /// orderly client disconnect.
    pub fn release(&self, session: &SessionId) {
        if self.leases.lock().remove(session).is_some() {
            debug!(%session, "lease released");
        }
    }

    /// Whether a session currently holds a lease.
    pub fn is_leased(&self, session: &SessionId) -> bool {
        self.leases.lock().contains_key(session)
    }

    /// Number of live leases.
    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    /// Whether no leases are held.
    pub fn is_empty(&self) -> bool {
        self.leases.lock().is_empty()
    }

    /// Registers an observer for expired sessions.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    /// Removes and returns every session whose renewal window has passed,
    /// notifying registered listeners for each.
    pub fn expire_overdue(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = {
            let mut leases = self.leases.lock();
            let expired: Vec<SessionId> = leases
                .iter()
                .filter(|(_, lease)| now.duration_since(lease.last_renewed) > lease.period)
                .map(|(session, _)| session.clone())
                .collect();
            for session in &expired {
                leases.remove(session);
            }
            expired
        };

        if !expired.is_empty() {
            let listeners = self.listeners.lock().clone();
            for session in &expired {
                info!(%session, "lease expired, terminating session");
                for listener in &listeners {
                    listener.connection_terminated(session);
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingListener(AtomicUsize);

    impl ConnectionListener for Arc<CountingListener> {
        fn connection_terminated(&self, _session_id: &SessionId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_renewal_keeps_lease_alive() {
        let registry = LeaseRegistry::new();
        let session = SessionId::generate();
        registry.renew(session.clone(), Duration::from_millis(80));

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(40));
            registry.renew(session.clone(), Duration::from_millis(80));
            assert!(registry.expire_overdue().is_empty());
        }
        assert!(registry.is_leased(&session));
    }

    #[test]
    fn test_missed_renewal_expires_and_notifies() {
        let registry = LeaseRegistry::new();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        registry.add_listener(Arc::new(listener.clone()));

        let session = SessionId::generate();
        registry.renew(session.clone(), Duration::from_millis(30));
        thread::sleep(Duration::from_millis(90));

        let expired = registry.expire_overdue();
        assert_eq!(expired, vec![session.clone()]);
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
        assert!(!registry.is_leased(&session));
    }

    #[test]
    fn test_release_is_not_an_expiry() {
        let registry = LeaseRegistry::new();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        registry.add_listener(Arc::new(listener.clone()));

        let session = SessionId::generate();
        registry.renew(session.clone(), Duration::from_millis(30));
        registry.release(&session);
        thread::sleep(Duration::from_millis(60));

        assert!(registry.expire_overdue().is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);
    }
}
