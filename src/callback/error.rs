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

//! Callback delivery error types.

use crate::invocation::ListenerId;
use std::io;
use thiserror::Error;

/// Errors raised by callback stores and dispatchers.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// The store was closed while a producer was enqueuing or blocked on
    /// the memory ceiling.
    ///
    /// This is the interruption path for a blocked producer; backpressure
    /// itself never raises an error.
    #[error("callback store is closed")]
    StoreClosed,

    /// A push delivery failed; the callback remains queued and will be
    /// redelivered in generation order.
    #[error("failed to deliver callback to {listener_id}: {reason}")]
    DeliveryFailed {
        /// The listener the delivery was for
        listener_id: ListenerId,
        /// Description of the failure
        reason: String,
    },

    /// The operation named a listener this server does not know.
    #[error("unknown listener {listener_id}")]
    UnknownListener {
        /// The unknown listener identity
        listener_id: ListenerId,
    },

    /// A disk-backed store failed to read or write its spool directory.
    #[error("callback spool I/O failure: {source}")]
    Spool {
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl From<io::Error> for CallbackError {
    fn from(source: io::Error) -> Self {
        CallbackError::Spool { source }
    }
}
