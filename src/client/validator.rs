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

//! Server-availability probing independent of leasing.

use crate::client::pinger::FailureHook;
use crate::client::SocketClientInvoker;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Detects a dead or unreachable server by periodic bare pings.
///
/// Unlike the [`LeasePinger`](crate::client::LeasePinger) this carries no
/// server-side lease semantics: its probes are `$PING$` invocations without
/// lease terms, and its sole purpose is to drive connection-failure
/// notification. Probes run on their own timer thread with their own
/// timeout, so a server whose worker pool is exhausted stalls the probe,
/// which then times out, rather than stalling any user invocation thread.
///
/// Listeners are notified once per failure episode; a probe succeeding
/// again re-arms the notification.
pub struct ConnectionValidator {
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
    last_probe_failed: Arc<AtomicBool>,
}

impl ConnectionValidator {
    /// Starts probing every `period` with the given `timeout`.
    ///
    /// `on_failure` runs on the validator thread at each transition from
    /// answering to not answering.
    pub fn start(
        invoker: Arc<SocketClientInvoker>,
        period: Duration,
        timeout: Duration,
        on_failure: FailureHook,
    ) -> Self {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let last_probe_failed = Arc::new(AtomicBool::new(false));
        let failed = last_probe_failed.clone();

        let thread = thread::Builder::new()
            .name("backhaul-connection-validator".to_string())
            .spawn(move || {
                debug!(?period, ?timeout, "connection validator started");
                loop {
                    match shutdown_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    match invoker.ping(None, timeout) {
                        Ok(()) => {
                            failed.store(false, Ordering::SeqCst);
                        }
                        Err(error) => {
                            // Notify on the edge, not on every failed probe.
                            if !failed.swap(true, Ordering::SeqCst) {
                                warn!(%error, "server stopped answering probes");
                                if let crate::error::BackhaulError::Transport(transport) = &error
                                {
                                    on_failure(transport);
                                }
                            }
                        }
                    }
                }
                debug!("connection validator stopped");
            })
            .expect("failed to spawn connection validator thread");

        Self {
            shutdown,
            thread: Some(thread),
            last_probe_failed,
        }
    }

    /// Whether the most recent probe failed.
    pub fn last_probe_failed(&self) -> bool {
        self.last_probe_failed.load(Ordering::SeqCst)
    }

    /// Stops the validator and joins its thread.
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

impl Drop for ConnectionValidator {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServerInvocationHandler;
    use crate::invocation::{InvocationRequest, Payload};
    use crate::locator::InvokerLocator;
    use crate::server::SocketServerInvoker;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Noop;
    impl ServerInvocationHandler for Noop {
        fn invoke(
            &self,
            _request: &InvocationRequest,
        ) -> Result<Payload, crate::handler::InvocationFault> {
            Ok(Payload::Null)
        }
    }

    #[test]
    fn test_validator_notifies_once_when_server_dies() {
        let locator = InvokerLocator::parse("socket://127.0.0.1:0/?timeout=2000").unwrap();
        let server = SocketServerInvoker::new(locator);
        server.register_handler("noop", Arc::new(Noop)).unwrap();
        server.start().unwrap();
        let addr = server.bound_addr().unwrap();

        let client_locator = InvokerLocator::parse(&format!(
            "socket://127.0.0.1:{}/?timeout=2000",
            addr.port()
        ))
        .unwrap();
        let invoker = Arc::new(SocketClientInvoker::new(client_locator));

        let notifications = Arc::new(AtomicUsize::new(0));
        let hook_notifications = notifications.clone();
        let validator = ConnectionValidator::start(
            invoker,
            Duration::from_millis(100),
            Duration::from_millis(300),
            Arc::new(move |_| {
                hook_notifications.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Server answering: no notifications.
        thread::sleep(Duration::from_millis(350));
        assert_eq!(notifications.load(Ordering::SeqCst), 0);
        assert!(!validator.last_probe_failed());

        // Kill the server; exactly one notification despite repeated probes.
        server.stop().unwrap();
        server.destroy();
        let deadline = Instant::now() + Duration::from_secs(3);
        while notifications.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
        assert!(validator.last_probe_failed());

        validator.stop();
    }
}
