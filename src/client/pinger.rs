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

//! Client-side lease keep-alive.

use crate::client::SocketClientInvoker;
use crate::invocation::LeaseRequest;
use crate::transport::TransportError;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Hook invoked on a probe thread when a probe fails.
pub(crate) type FailureHook = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Periodically renews this client's server-side lease.
///
/// Active only when the client requested lease keep-alive. Every
/// `lease_period / 2` the pinger sends a `$PING$` invocation carrying the
/// lease terms, on its own timer thread with its own timeout
/// (`leasePingerTimeout` if configured, the invoker's general timeout
/// otherwise). A probe must never block behind, or inherit the deadline
/// of, a user invocation.
///
/// Two flags are observable independently: [`ping_invoked`] becomes true
/// when a probe is handed to the transport, [`ping_succeeded`] only when
/// its response arrives. A probe stuck in flight is therefore visible
/// before it times out. A failed probe leaves the client intact; it is a
/// signal consumed by connection-failure notification.
///
/// [`ping_invoked`]: LeasePinger::ping_invoked
/// [`ping_succeeded`]: LeasePinger::ping_succeeded
pub struct LeasePinger {
    ping_invoked: Arc<AtomicBool>,
    ping_succeeded: Arc<AtomicBool>,
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl LeasePinger {
    /// Starts pinging immediately and then every `lease_period / 2`.
    ///
    /// `on_failure` runs on the pinger thread for every probe that does not
    /// succeed within `timeout`.
    pub fn start(
        invoker: Arc<SocketClientInvoker>,
        lease_period: Duration,
        timeout: Duration,
        on_failure: FailureHook,
    ) -> Self {
        let ping_invoked = Arc::new(AtomicBool::new(false));
        let ping_succeeded = Arc::new(AtomicBool::new(false));
        let (shutdown, shutdown_rx) = bounded::<()>(1);

        let invoked = ping_invoked.clone();
        let succeeded = ping_succeeded.clone();
        let interval = lease_period / 2;
        let lease = LeaseRequest {
            period_ms: lease_period.as_millis() as u64,
        };
        let thread = thread::Builder::new()
            .name("backhaul-lease-pinger".to_string())
            .spawn(move || {
                debug!(?interval, ?timeout, "lease pinger started");
                loop {
                    invoked.store(true, Ordering::SeqCst);
                    succeeded.store(false, Ordering::SeqCst);
                    match invoker.ping(Some(lease), timeout) {
                        Ok(()) => {
                            succeeded.store(true, Ordering::SeqCst);
                        }
                        Err(error) => {
                            warn!(%error, "lease ping failed");
                            if let crate::error::BackhaulError::Transport(transport) = &error {
                                on_failure(transport);
                            }
                        }
                    }
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                debug!("lease pinger stopped");
            })
            .expect("failed to spawn lease pinger thread");

        Self {
            ping_invoked,
            ping_succeeded,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Whether a probe has been handed to the transport.
    pub fn ping_invoked(&self) -> bool {
        self.ping_invoked.load(Ordering::SeqCst)
    }

    /// Whether the most recent probe's response arrived.
    pub fn ping_succeeded(&self) -> bool {
        self.ping_succeeded.load(Ordering::SeqCst)
    }

    /// Stops the pinger and joins its thread.
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LeasePinger {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::InvokerLocator;
    use std::net::TcpListener;
    use std::time::Instant;

    fn mute_server() -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        // Accepts and holds connections without ever answering.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept() {
                held.push(stream);
                if held.len() >= 8 {
                    break;
                }
            }
        });
        (addr, handle)
    }

    #[test]
    fn test_mute_server_leaves_succeeded_false_within_pinger_timeout() {
        let (addr, _server) = mute_server();
        let locator = InvokerLocator::parse(&format!(
            "socket://127.0.0.1:{}/?timeout=30000&leasePingerTimeout=1000",
            addr.port()
        ))
        .unwrap();
        let timeout = locator
            .lease_pinger_timeout()
            .unwrap_or_else(|| locator.timeout());
        assert_eq!(timeout, Duration::from_millis(1000));
        let invoker = Arc::new(SocketClientInvoker::new(locator));

        let started = Instant::now();
        let pinger = LeasePinger::start(
            invoker,
            Duration::from_secs(10),
            timeout,
            Arc::new(|_| {}),
        );

        // The probe is in flight almost immediately...
        let deadline = Instant::now() + Duration::from_millis(500);
        while !pinger.ping_invoked() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(pinger.ping_invoked());
        assert!(!pinger.ping_succeeded());

        // ...and still unanswered once its dedicated timeout has elapsed,
        // far sooner than the 30s general timeout would allow.
        thread::sleep(Duration::from_millis(1200));
        assert!(!pinger.ping_succeeded());
        assert!(started.elapsed() < Duration::from_secs(5));
        pinger.stop();
    }

    #[test]
    fn test_failure_hook_fires_on_unanswered_ping() {
        let (addr, _server) = mute_server();
        let locator = InvokerLocator::parse(&format!(
            "socket://127.0.0.1:{}/?leasePingerTimeout=200",
            addr.port()
        ))
        .unwrap();
        let invoker = Arc::new(SocketClientInvoker::new(locator));

        let failures = Arc::new(AtomicBool::new(false));
        let hook_failures = failures.clone();
        let pinger = LeasePinger::start(
            invoker,
            Duration::from_secs(10),
            Duration::from_millis(200),
            Arc::new(move |_| hook_failures.store(true, Ordering::SeqCst)),
        );

        let deadline = Instant::now() + Duration::from_secs(3);
        while !failures.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(failures.load(Ordering::SeqCst));
        pinger.stop();
    }
}
