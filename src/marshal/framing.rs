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

//! Length-prefixed message framing.
//!
//! Each message is prefixed with a 4-byte (u32) big-endian length header,
//! followed by the payload:
//!
//! ```text
//! +------------------+-------------------+
//! | Length (4 bytes) | Payload (N bytes) |
//! +------------------+-------------------+
//! ```
//!
//! Reads and writes are blocking and operate on whole frames; a read
//! returns only once the complete payload has arrived or the stream has
//! failed.

use crate::marshal::MarshalError;
use std::io::{Read, Write};

/// Maximum frame size (16 MB).
///
/// Bounds the memory one peer can force the other to allocate for a single
/// message.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the frame length header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Writes one length-prefixed frame and flushes the stream.
///
/// # Errors
///
/// Returns a [`MarshalError`] if the payload exceeds [`MAX_FRAME_SIZE`] or
/// the stream fails.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), MarshalError> {
    let len = payload.len();
    if len > MAX_FRAME_SIZE as usize {
        return Err(MarshalError::FrameTooLarge {
            size: len as u32,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed frame, blocking until it is complete.
///
/// # Errors
///
/// Returns a [`MarshalError`] if the announced length exceeds
/// [`MAX_FRAME_SIZE`] or the stream fails before the payload completes
/// (including an orderly close mid-frame, surfaced as `UnexpectedEof`).
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, MarshalError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(MarshalError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
