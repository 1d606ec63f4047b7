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

//! Transport layer error types.
//!
//! The taxonomy keeps three conditions callers must be able to tell apart
//! strictly separate:
//!
//! - **Cannot connect**: establishment failed after every configured
//!   attempt. Never reported as a generic I/O error.
//! - **Timeout**: an established exchange exceeded its deadline.
//! - **Interrupted**: the blocked thread was interrupted (e.g. process
//!   shutdown). Never conflated with either of the above.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by connection establishment and stream I/O.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishment failed after exhausting every configured attempt.
    #[error("cannot connect to {address} after {attempts} attempt(s): {source}")]
    CannotConnect {
        /// The address that refused or never answered
        address: String,
        /// How many attempts were made
        attempts: u32,
        /// The final attempt's underlying error
        #[source]
        source: io::Error,
    },

    /// An established connection became unusable mid-exchange.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Description of how the loss was observed
        reason: String,
        /// The underlying I/O error, if one surfaced
        #[source]
        source: Option<io::Error>,
    },

    /// An exchange exceeded its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// The deadline that was exceeded
        duration: Duration,
    },

    /// The blocked thread was interrupted.
    #[error("blocked operation was interrupted")]
    Interrupted,

    /// A server socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        /// The address that failed to bind
        address: String,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The invoker or pool the operation needed is already closed.
    #[error("transport is closed")]
    Closed,

    /// An I/O failure with no more specific classification.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    /// Classifies an I/O error from a timed exchange.
    ///
    /// Blocking sockets surface an expired read/write deadline as
    /// `TimedOut` or `WouldBlock` depending on platform; both become
    /// [`TransportError::Timeout`] carrying the deadline that applied.
    pub fn from_io(source: io::Error, deadline: Duration) -> Self {
        match source.kind() {
            io::ErrorKind::Interrupted => TransportError::Interrupted,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                TransportError::Timeout { duration: deadline }
            }
            _ => TransportError::Io { source },
        }
    }

    /// Whether a fresh connection attempt may succeed where this one failed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::CannotConnect { .. }
            | TransportError::ConnectionLost { .. }
            | TransportError::Timeout { .. } => true,
            TransportError::Io { source } => !matches!(
                source.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ),
            TransportError::Interrupted
            | TransportError::BindFailed { .. }
            | TransportError::Closed => false,
        }
    }

    /// Whether this is the distinct cannot-connect condition.
    #[must_use]
    pub fn is_cannot_connect(&self) -> bool {
        matches!(self, TransportError::CannotConnect { .. })
    }

    /// Whether this is a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// Whether the blocked thread was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransportError::Interrupted)
    }
}

impl From<io::Error> for TransportError {
    fn from(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::Interrupted => TransportError::Interrupted,
            _ => TransportError::Io { source },
        }
    }
}
