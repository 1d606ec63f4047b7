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

//! Recognized locator parameters and their typed accessors.
//!
//! All parameters are optional. A missing or unparseable value falls back to
//! the documented default; unparseable values are logged at `warn` rather
//! than failing the invoker, since locators commonly travel between peers
//! with parameters meant for other consumers.

use super::InvokerLocator;
use std::time::Duration;
use tracing::warn;

/// Server-side worker thread cap.
pub const MAX_POOL_SIZE: &str = "maxPoolSize";
/// Client-side pooled connection cap.
pub const CLIENT_MAX_POOL_SIZE: &str = "clientMaxPoolSize";
/// Per-invocation timeout in milliseconds.
pub const TIMEOUT: &str = "timeout";
/// Idle worker eviction timeout in seconds.
pub const IDLE_TIMEOUT: &str = "idleTimeout";
/// Listen backlog for the server socket.
pub const BACKLOG: &str = "backlog";
/// Whether the client keeps a server-side lease alive.
pub const ENABLE_LEASE: &str = "enableLease";
/// Lease period in milliseconds.
pub const LEASE_PERIOD: &str = "leasePeriod";
/// Dedicated timeout for lease pings, in milliseconds.
pub const LEASE_PINGER_TIMEOUT: &str = "leasePingerTimeout";
/// Number of invocation attempts before surfacing a connect failure.
pub const NUMBER_OF_CALL_ATTEMPTS: &str = "numberOfCallAttempts";
/// Older alias for [`NUMBER_OF_CALL_ATTEMPTS`].
pub const NUMBER_OF_CALL_RETRIES: &str = "numberOfCallRetries";
/// Probe the connection for a half-closed peer after each response.
pub const CHECK_CONNECTION: &str = "socket.check_connection";
/// Connection validator probe period in milliseconds.
pub const VALIDATOR_PING_PERIOD: &str = "validatorPingPeriod";
/// Connection validator probe timeout in milliseconds.
pub const VALIDATOR_PING_TIMEOUT: &str = "validatorPingTimeout";
/// Memory ceiling in bytes for a listener's callback store.
pub const CALLBACK_MEMORY_CEILING: &str = "callbackMemoryCeiling";
/// Callback store flavor: `memory` (default) or `disk`.
pub const CALLBACK_STORE: &str = "callbackStore";
/// Spool directory for the disk callback store.
pub const CALLBACK_STORE_DIRECTORY: &str = "callbackStoreDirectory";
/// Bind port for the bisocket secondary (control) listener.
pub const SECONDARY_BIND_PORT: &str = "secondaryBindPort";
/// Connector acts purely as a callback-receiving endpoint.
pub const CALLBACK_SERVER_ONLY: &str = "callbackServerOnly";
/// Minimum number of live bisocket control connections.
pub const MIN_CONTROL_CONNECTIONS: &str = "minControlConnections";
/// Wire codec selector (`json` by default).
pub const MARSHALLER: &str = "marshaller";

/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);
/// Default server worker cap.
pub const DEFAULT_MAX_POOL_SIZE: usize = 300;
/// Default client connection cap.
pub const DEFAULT_CLIENT_MAX_POOL_SIZE: usize = 50;
/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 200;
/// Default lease period.
pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_millis(5_000);
/// Default number of invocation attempts.
pub const DEFAULT_CALL_ATTEMPTS: u32 = 1;
/// Default validator probe period.
pub const DEFAULT_VALIDATOR_PING_PERIOD: Duration = Duration::from_millis(2_000);
/// Default validator probe timeout.
pub const DEFAULT_VALIDATOR_PING_TIMEOUT: Duration = Duration::from_millis(1_000);
/// Default callback store memory ceiling (16 MB).
pub const DEFAULT_CALLBACK_MEMORY_CEILING: usize = 16 * 1024 * 1024;
/// Default minimum of live control connections.
pub const DEFAULT_MIN_CONTROL_CONNECTIONS: usize = 2;

impl InvokerLocator {
    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.parameter(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(locator = %self, key, raw, "ignoring unparseable locator parameter");
                None
            }
        }
    }

    /// Per-invocation timeout ([`TIMEOUT`], milliseconds).
    pub fn timeout(&self) -> Duration {
        self.parsed::<u64>(TIMEOUT)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Server worker cap ([`MAX_POOL_SIZE`]), at least one.
    pub fn max_pool_size(&self) -> usize {
        self.parsed(MAX_POOL_SIZE)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE)
            .max(1)
    }

    /// Client pooled-connection cap ([`CLIENT_MAX_POOL_SIZE`]), at least one.
    pub fn client_max_pool_size(&self) -> usize {
        self.parsed(CLIENT_MAX_POOL_SIZE)
            .unwrap_or(DEFAULT_CLIENT_MAX_POOL_SIZE)
            .max(1)
    }

    /// Idle worker eviction timeout ([`IDLE_TIMEOUT`], seconds).
    ///
    /// `None` disables idle eviction.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.parsed::<u64>(IDLE_TIMEOUT).map(Duration::from_secs)
    }

    /// Listen backlog ([`BACKLOG`]).
    pub fn backlog(&self) -> u32 {
        self.parsed(BACKLOG).unwrap_or(DEFAULT_BACKLOG)
    }

    /// Whether lease keep-alive is requested ([`ENABLE_LEASE`]).
    pub fn enable_lease(&self) -> bool {
        self.parsed(ENABLE_LEASE).unwrap_or(false)
    }

    /// Lease period ([`LEASE_PERIOD`], milliseconds).
    pub fn lease_period(&self) -> Duration {
        self.parsed::<u64>(LEASE_PERIOD)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LEASE_PERIOD)
    }

    /// Dedicated lease-ping timeout ([`LEASE_PINGER_TIMEOUT`], milliseconds).
    ///
    /// `None` means the pinger inherits the invoker's general timeout.
    pub fn lease_pinger_timeout(&self) -> Option<Duration> {
        self.parsed::<u64>(LEASE_PINGER_TIMEOUT)
            .map(Duration::from_millis)
    }

    /// Number of invocation attempts ([`NUMBER_OF_CALL_ATTEMPTS`], falling
    /// back to the [`NUMBER_OF_CALL_RETRIES`] alias).
    pub fn number_of_call_attempts(&self) -> u32 {
        self.parsed(NUMBER_OF_CALL_ATTEMPTS)
            .or_else(|| self.parsed(NUMBER_OF_CALL_RETRIES))
            .unwrap_or(DEFAULT_CALL_ATTEMPTS)
            .max(1)
    }

    /// Whether workers probe for half-closed peers ([`CHECK_CONNECTION`]).
    pub fn check_connection(&self) -> bool {
        self.parsed(CHECK_CONNECTION).unwrap_or(false)
    }

    /// Connection validator probe period ([`VALIDATOR_PING_PERIOD`]).
    pub fn validator_ping_period(&self) -> Duration {
        self.parsed::<u64>(VALIDATOR_PING_PERIOD)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_VALIDATOR_PING_PERIOD)
    }

    /// Connection validator probe timeout ([`VALIDATOR_PING_TIMEOUT`]).
    pub fn validator_ping_timeout(&self) -> Duration {
        self.parsed::<u64>(VALIDATOR_PING_TIMEOUT)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_VALIDATOR_PING_TIMEOUT)
    }

    /// Callback store memory ceiling ([`CALLBACK_MEMORY_CEILING`], bytes).
    pub fn callback_memory_ceiling(&self) -> usize {
        self.parsed(CALLBACK_MEMORY_CEILING)
            .unwrap_or(DEFAULT_CALLBACK_MEMORY_CEILING)
    }

    /// Bisocket secondary listener bind port ([`SECONDARY_BIND_PORT`]).
    ///
    /// Zero (the default) requests an ephemeral port.
    pub fn secondary_bind_port(&self) -> u16 {
        self.parsed(SECONDARY_BIND_PORT).unwrap_or(0)
    }

    /// Whether this connector only receives callbacks ([`CALLBACK_SERVER_ONLY`]).
    pub fn callback_server_only(&self) -> bool {
        self.parsed(CALLBACK_SERVER_ONLY).unwrap_or(false)
    }

    /// Minimum live control connections ([`MIN_CONTROL_CONNECTIONS`]).
    pub fn min_control_connections(&self) -> usize {
        self.parsed(MIN_CONTROL_CONNECTIONS)
            .unwrap_or(DEFAULT_MIN_CONTROL_CONNECTIONS)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(query: &str) -> InvokerLocator {
        InvokerLocator::parse(&format!("socket://127.0.0.1:5400/?{query}")).unwrap()
    }

    #[test]
    fn test_defaults_apply_when_absent() {
        let locator = locator("");
        assert_eq!(locator.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(locator.max_pool_size(), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(locator.client_max_pool_size(), DEFAULT_CLIENT_MAX_POOL_SIZE);
        assert_eq!(locator.idle_timeout(), None);
        assert_eq!(locator.backlog(), DEFAULT_BACKLOG);
        assert!(!locator.enable_lease());
        assert_eq!(locator.number_of_call_attempts(), DEFAULT_CALL_ATTEMPTS);
        assert!(!locator.check_connection());
        assert_eq!(locator.lease_pinger_timeout(), None);
    }

    #[test]
    fn test_typed_values_parse() {
        let locator = locator(
            "timeout=2500&maxPoolSize=8&idleTimeout=30&enableLease=true&leasePeriod=900&socket.check_connection=true",
        );
        assert_eq!(locator.timeout(), Duration::from_millis(2500));
        assert_eq!(locator.max_pool_size(), 8);
        assert_eq!(locator.idle_timeout(), Some(Duration::from_secs(30)));
        assert!(locator.enable_lease());
        assert_eq!(locator.lease_period(), Duration::from_millis(900));
        assert!(locator.check_connection());
    }

    #[test]
    fn test_call_attempts_alias_and_floor() {
        assert_eq!(locator("numberOfCallAttempts=5").number_of_call_attempts(), 5);
        assert_eq!(locator("numberOfCallRetries=3").number_of_call_attempts(), 3);
        // explicit attempts win over the alias
        assert_eq!(
            locator("numberOfCallAttempts=2&numberOfCallRetries=9").number_of_call_attempts(),
            2
        );
        assert_eq!(locator("numberOfCallAttempts=0").number_of_call_attempts(), 1);
    }

    #[test]
    fn test_unparseable_value_falls_back() {
        let locator = locator("timeout=soon");
        assert_eq!(locator.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_unknown_parameters_preserved() {
        let locator = locator("vendor.flag=7");
        assert_eq!(locator.parameter("vendor.flag"), Some("7"));
    }
}
