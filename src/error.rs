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

//! Top-level error type.
//!
//! Application code sees exactly three shapes of failure from an
//! invocation: a typed connection/timeout condition
//! ([`BackhaulError::Transport`]), a propagated application fault
//! ([`BackhaulError::Invocation`]), or a local misuse/configuration error.
//! Everything else is internal bookkeeping that the runtime logs and heals
//! itself.

use crate::callback::CallbackError;
use crate::locator::LocatorError;
use crate::marshal::MarshalError;
use crate::pool::PoolError;
use crate::transport::TransportError;
use thiserror::Error;

/// Unified error type for the runtime.
#[derive(Debug, Error)]
pub enum BackhaulError {
    /// Connection establishment or stream failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Wire codec or framing failure.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// Callback store or delivery failure.
    #[error(transparent)]
    Callback(#[from] CallbackError),

    /// A locator string did not parse.
    #[error(transparent)]
    Locator(#[from] LocatorError),

    /// A pool operation failed, typically during shutdown.
    #[error("pool operation failed: {0}")]
    Pool(#[from] PoolError),

    /// An application-level fault propagated from the remote handler.
    #[error("invocation fault: {message}")]
    Invocation {
        /// The handler's failure description.
        message: String,
    },

    /// A lifecycle method was called in the wrong state.
    #[error("invalid lifecycle state: {message}")]
    InvalidState {
        /// What was attempted and why it is illegal.
        message: String,
    },

    /// A configuration value is unusable.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },
}

impl BackhaulError {
    /// Whether this is the distinct cannot-connect condition.
    #[must_use]
    pub fn is_cannot_connect(&self) -> bool {
        matches!(self, BackhaulError::Transport(t) if t.is_cannot_connect())
    }

    /// Whether this is a deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, BackhaulError::Transport(t) if t.is_timeout())
    }

    /// Whether a blocked thread was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BackhaulError::Transport(t) if t.is_interrupted())
    }

    /// Whether this is an application fault rather than a runtime failure.
    #[must_use]
    pub fn is_invocation_fault(&self) -> bool {
        matches!(self, BackhaulError::Invocation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_predicates_follow_the_transport_taxonomy() {
        let cannot: BackhaulError = TransportError::CannotConnect {
            address: "h:1".to_string(),
            attempts: 2,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        }
        .into();
        assert!(cannot.is_cannot_connect());
        assert!(!cannot.is_timeout());

        let timeout: BackhaulError = TransportError::Timeout {
            duration: Duration::from_secs(1),
        }
        .into();
        assert!(timeout.is_timeout());
        assert!(!timeout.is_cannot_connect());

        let interrupted: BackhaulError = TransportError::Interrupted.into();
        assert!(interrupted.is_interrupted());

        let fault = BackhaulError::Invocation {
            message: "boom".to_string(),
        };
        assert!(fault.is_invocation_fault());
        assert!(!fault.is_cannot_connect());
    }
}
