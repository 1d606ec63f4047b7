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

//! Immutable endpoint descriptors.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

/// Parameter keys stripped by [`InvokerLocator::strip_sensitive`].
///
/// A key is considered sensitive if its lowercased form contains one of
/// these substrings.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["password", "secret", "token"];

/// Errors raised while parsing a locator string.
#[derive(Debug, Error)]
pub enum LocatorError {
    /// The locator string is not a parseable URI.
    #[error("malformed locator {locator:?}: {source}")]
    Malformed {
        /// The offending locator string
        locator: String,
        /// The underlying parse error
        #[source]
        source: url::ParseError,
    },

    /// The locator has no host component.
    #[error("locator {locator:?} has no host")]
    MissingHost {
        /// The offending locator string
        locator: String,
    },

    /// The locator has no port component.
    #[error("locator {locator:?} has no port")]
    MissingPort {
        /// The offending locator string
        locator: String,
    },
}

/// Immutable descriptor of a remote endpoint.
///
/// A locator names a transport, a host, a port, an optional path, and a map
/// of configuration parameters:
///
/// ```text
/// transport://host:port/path?key1=value1&key2=value2
/// ```
///
/// Locators are never mutated after construction. Two locators naming the
/// same logical endpoint compare equal even when constructed from different
/// literal strings: the transport is compared case-insensitively, wildcard
/// bind addresses (`0.0.0.0`, `::`) normalize to the loopback address, and
/// parameter order is irrelevant.
///
/// # Examples
///
/// ```rust
/// use backhaul::locator::InvokerLocator;
///
/// let locator = InvokerLocator::parse("socket://127.0.0.1:5400/?timeout=5000").unwrap();
/// assert_eq!(locator.transport(), "socket");
/// assert_eq!(locator.host(), "127.0.0.1");
/// assert_eq!(locator.port(), 5400);
/// assert_eq!(locator.parameter("timeout"), Some("5000"));
///
/// let wildcard = InvokerLocator::parse("SOCKET://0.0.0.0:5400/?timeout=5000").unwrap();
/// assert_eq!(locator, wildcard);
/// ```
#[derive(Debug, Clone)]
pub struct InvokerLocator {
    transport: String,
    host: String,
    port: u16,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl InvokerLocator {
    /// Parses a locator from its `transport://host:port/path?k=v` form.
    ///
    /// # Errors
    ///
    /// Returns a [`LocatorError`] if the string is not a well-formed URI or
    /// lacks a host or port.
    pub fn parse(locator: &str) -> Result<Self, LocatorError> {
        let url = Url::parse(locator).map_err(|source| LocatorError::Malformed {
            locator: locator.to_string(),
            source,
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| LocatorError::MissingHost {
                locator: locator.to_string(),
            })?
            .to_string();
        let port = url.port().ok_or_else(|| LocatorError::MissingPort {
            locator: locator.to_string(),
        })?;

        let parameters = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        Ok(Self {
            transport: url.scheme().to_ascii_lowercase(),
            host,
            port,
            path: url.path().trim_end_matches('/').to_string(),
            parameters,
        })
    }

    /// Builds a locator from its components.
    pub fn new(
        transport: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let transport = transport.into().to_ascii_lowercase();
        let path = path.into();
        Self {
            transport,
            host: host.into(),
            port,
            path: path.trim_end_matches('/').to_string(),
            parameters,
        }
    }

    /// The transport identifier, lowercased (`socket`, `bisocket`, ...).
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The host component exactly as written.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The path component, without a trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full parameter map.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Looks up a single parameter.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Returns a copy of this locator with one parameter added or replaced.
    ///
    /// The receiver is untouched; locators are immutable.
    #[must_use]
    pub fn with_parameter(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.parameters.insert(key.into(), value.into());
        copy
    }

    /// The host a client should actually dial.
    ///
    /// Wildcard bind addresses are only meaningful on the server side;
    /// clients normalize them to loopback.
    pub fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            host => host,
        }
    }

    /// Canonical cache-key string for invoker deduplication.
    ///
    /// Two locators naming the same logical endpoint with the same
    /// configuration produce the same signature. Parameters participate
    /// because invokers configured differently must not be shared.
    pub fn signature(&self) -> String {
        let mut signature = format!(
            "{}://{}:{}{}",
            self.transport,
            self.connect_host().to_ascii_lowercase(),
            self.port,
            self.path
        );
        for (key, value) in &self.parameters {
            signature.push('&');
            signature.push_str(key);
            signature.push('=');
            signature.push_str(value);
        }
        signature
    }

    /// Returns a private copy with credential-bearing parameters removed,
    /// suitable for handing to a remote peer.
    ///
    /// The shared instance is never mutated.
    #[must_use]
    pub fn strip_sensitive(&self) -> Self {
        let mut copy = self.clone();
        copy.parameters.retain(|key, _| {
            let lower = key.to_ascii_lowercase();
            !SENSITIVE_KEY_FRAGMENTS
                .iter()
                .any(|fragment| lower.contains(fragment))
        });
        copy
    }
}

impl fmt::Display for InvokerLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}{}", self.transport, self.host, self.port, self.path)?;
        let mut separator = '?';
        for (key, value) in &self.parameters {
            write!(f, "{separator}{key}={value}")?;
            separator = '&';
        }
        Ok(())
    }
}

impl FromStr for InvokerLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for InvokerLocator {
    fn eq(&self, other: &Self) -> bool {
        self.signature() == other.signature()
    }
}

impl Eq for InvokerLocator {}

impl Hash for InvokerLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signature().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_locator() {
        let locator =
            InvokerLocator::parse("socket://10.0.0.7:4446/services?timeout=3000&backlog=10")
                .unwrap();
        assert_eq!(locator.transport(), "socket");
        assert_eq!(locator.host(), "10.0.0.7");
        assert_eq!(locator.port(), 4446);
        assert_eq!(locator.path(), "/services");
        assert_eq!(locator.parameter("timeout"), Some("3000"));
        assert_eq!(locator.parameter("backlog"), Some("10"));
        assert_eq!(locator.parameter("missing"), None);
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        let result = InvokerLocator::parse("socket://10.0.0.7/");
        assert!(matches!(result, Err(LocatorError::MissingPort { .. })));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(InvokerLocator::parse("not a locator").is_err());
    }

    #[test]
    fn test_logical_equality_ignores_case_and_parameter_order() {
        let a = InvokerLocator::parse("socket://Host.Example:99/?b=2&a=1").unwrap();
        let b = InvokerLocator::parse("SOCKET://host.example:99/?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_wildcard_host_normalizes_to_loopback() {
        let bind = InvokerLocator::parse("socket://0.0.0.0:99/").unwrap();
        let local = InvokerLocator::parse("socket://127.0.0.1:99/").unwrap();
        assert_eq!(bind.connect_host(), "127.0.0.1");
        assert_eq!(bind, local);
    }

    #[test]
    fn test_differing_parameters_are_distinct_endpoints() {
        let a = InvokerLocator::parse("socket://h:99/?timeout=1000").unwrap();
        let b = InvokerLocator::parse("socket://h:99/?timeout=2000").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_strip_sensitive_removes_credentials_on_a_copy() {
        let locator =
            InvokerLocator::parse("socket://h:99/?password=hunter2&authToken=abc&timeout=50")
                .unwrap();
        let stripped = locator.strip_sensitive();
        assert_eq!(stripped.parameter("password"), None);
        assert_eq!(stripped.parameter("authToken"), None);
        assert_eq!(stripped.parameter("timeout"), Some("50"));
        // original untouched
        assert_eq!(locator.parameter("password"), Some("hunter2"));
    }

    #[test]
    fn test_with_parameter_copies() {
        let locator = InvokerLocator::parse("socket://h:99/").unwrap();
        let changed = locator.with_parameter("timeout", "250");
        assert_eq!(changed.parameter("timeout"), Some("250"));
        assert_eq!(locator.parameter("timeout"), None);
    }

    #[test]
    fn test_display_round_trips() {
        let text = "socket://10.0.0.7:4446/services?backlog=10&timeout=3000";
        let locator = InvokerLocator::parse(text).unwrap();
        let reparsed = InvokerLocator::parse(&locator.to_string()).unwrap();
        assert_eq!(locator, reparsed);
    }
}
