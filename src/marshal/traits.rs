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

use crate::invocation::WireMessage;
use crate::marshal::MarshalError;
use std::io::{Read, Write};

/// Encodes wire messages onto a blocking byte stream.
///
/// A marshaller owns the complete on-wire representation of a message,
/// framing included, so alternative codecs can use alternative frame
/// layouts. Implementations must be cheap to share across worker threads.
///
/// # Examples
///
/// ```rust
/// use backhaul::invocation::{InvocationResponse, WireMessage};
/// use backhaul::marshal::{JsonMarshaller, Marshaller, UnMarshaller};
///
/// let codec = JsonMarshaller::default();
/// let message = WireMessage::Response(InvocationResponse::ack());
///
/// let mut wire = Vec::new();
/// codec.write_message(&message, &mut wire).unwrap();
///
/// let mut reader = &wire[..];
/// let decoded = codec.read_message(&mut reader).unwrap();
/// assert_eq!(message, decoded);
/// ```
pub trait Marshaller: Send + Sync {
    /// Encodes and frames one message onto `writer`, flushing it.
    ///
    /// # Errors
    ///
    /// Returns a [`MarshalError`] if encoding fails or the stream breaks.
    fn write_message(
        &self,
        message: &WireMessage,
        writer: &mut dyn Write,
    ) -> Result<(), MarshalError>;

    /// Clones this marshaller for another connection.
    fn boxed_clone(&self) -> Box<dyn Marshaller>;
}

/// Decodes wire messages from a blocking byte stream.
///
/// The counterpart of [`Marshaller`]; see its documentation for the framing
/// contract.
pub trait UnMarshaller: Send + Sync {
    /// Reads and decodes one complete message from `reader`, blocking until
    /// a full frame arrives or the stream fails.
    ///
    /// # Errors
    ///
    /// Returns a [`MarshalError`] if the frame is oversized, the payload
    /// does not decode, or the stream breaks (including read timeouts,
    /// surfaced as [`MarshalError::Io`]).
    fn read_message(&self, reader: &mut dyn Read) -> Result<WireMessage, MarshalError>;

    /// Clones this unmarshaller for another connection.
    fn boxed_clone(&self) -> Box<dyn UnMarshaller>;
}

impl Clone for Box<dyn Marshaller> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

impl Clone for Box<dyn UnMarshaller> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}
