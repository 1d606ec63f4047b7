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

//! Codec and framing error types.

use std::io;
use thiserror::Error;

/// Errors raised while encoding, decoding, or framing wire messages.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// A message could not be encoded.
    #[error("failed to encode message: {reason}")]
    Encode {
        /// Description of the failure
        reason: String,
    },

    /// A frame's payload could not be decoded.
    #[error("failed to decode message: {reason}")]
    Decode {
        /// Description of the failure
        reason: String,
    },

    /// A frame announced a payload larger than the configured bound.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced payload size
        size: u32,
        /// Configured maximum
        max: u32,
    },

    /// The underlying stream failed mid-frame.
    #[error("I/O failure during framing: {source}")]
    Io {
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl MarshalError {
    /// Whether the failure came from the underlying stream rather than the
    /// codec, meaning the connection itself is suspect.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, MarshalError::Io { .. })
    }

    /// The underlying I/O error kind, when [`is_io`](Self::is_io).
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            MarshalError::Io { source } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for MarshalError {
    fn from(source: io::Error) -> Self {
        MarshalError::Io { source }
    }
}
