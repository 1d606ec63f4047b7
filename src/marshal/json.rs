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

//! JSON wire codec, the default when a locator names none.

use crate::invocation::WireMessage;
use crate::marshal::framing::{read_frame, write_frame};
use crate::marshal::{MarshalError, Marshaller, UnMarshaller};
use std::io::{Read, Write};

/// Length-prefixed JSON codec.
///
/// Messages are serialized with `serde_json` and framed by
/// [`framing`](crate::marshal::framing). Stateless, so one instance can be
/// shared by every connection of an invoker.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn write_message(
        &self,
        message: &WireMessage,
        writer: &mut dyn Write,
    ) -> Result<(), MarshalError> {
        let payload = serde_json::to_vec(message).map_err(|e| MarshalError::Encode {
            reason: e.to_string(),
        })?;
        write_frame(writer, &payload)
    }

    fn boxed_clone(&self) -> Box<dyn Marshaller> {
        Box::new(*self)
    }
}

impl UnMarshaller for JsonMarshaller {
    fn read_message(&self, reader: &mut dyn Read) -> Result<WireMessage, MarshalError> {
        let payload = read_frame(reader)?;
        serde_json::from_slice(&payload).map_err(|e| MarshalError::Decode {
            reason: e.to_string(),
        })
    }

    fn boxed_clone(&self) -> Box<dyn UnMarshaller> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationRequest, Operation, Payload, SessionId};

    #[test]
    fn test_json_round_trip() {
        let codec = JsonMarshaller;
        let message = WireMessage::Request(InvocationRequest {
            session_id: SessionId::generate(),
            subsystem: "billing".to_string(),
            operation: Operation::Call {
                payload: serde_json::json!({"invoice": 42}),
            },
        });

        let mut wire = Vec::new();
        codec.write_message(&message, &mut wire).unwrap();
        let mut reader = &wire[..];
        assert_eq!(codec.read_message(&mut reader).unwrap(), message);
    }

    #[test]
    fn test_undecodable_payload_is_a_decode_error() {
        let codec = JsonMarshaller;
        let mut wire = Vec::new();
        write_frame(&mut wire, b"not json").unwrap();
        let mut reader = &wire[..];
        assert!(matches!(
            codec.read_message(&mut reader),
            Err(MarshalError::Decode { .. })
        ));
    }

    #[test]
    fn test_consecutive_messages_share_a_stream() {
        let codec = JsonMarshaller;
        let first = WireMessage::Request(InvocationRequest {
            session_id: SessionId::generate(),
            subsystem: "a".to_string(),
            operation: Operation::Call {
                payload: Payload::from(1),
            },
        });
        let second = WireMessage::Request(InvocationRequest {
            session_id: SessionId::generate(),
            subsystem: "b".to_string(),
            operation: Operation::Call {
                payload: Payload::from(2),
            },
        });

        let mut wire = Vec::new();
        codec.write_message(&first, &mut wire).unwrap();
        codec.write_message(&second, &mut wire).unwrap();

        let mut reader = &wire[..];
        assert_eq!(codec.read_message(&mut reader).unwrap(), first);
        assert_eq!(codec.read_message(&mut reader).unwrap(), second);
    }
}
