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

//! Wire codecs and message framing.
//!
//! The runtime owns no codec logic itself: connections call a pluggable
//! [`Marshaller`]/[`UnMarshaller`] pair at the boundary and never interpret
//! bytes beyond that. The [`framing`] module supplies the length-prefixed
//! frame layout codecs share, and [`JsonMarshaller`] is the default codec
//! selected when a locator names none.

pub mod framing;

mod error;
mod json;
mod traits;

pub use error::MarshalError;
pub use json::JsonMarshaller;
pub use traits::{Marshaller, UnMarshaller};

use crate::locator::{params, InvokerLocator};

/// Builds the codec pair a locator asks for.
///
/// The `marshaller` parameter selects the codec; `json` (the default) is the
/// only built-in. Unknown names fall back to JSON with a warning rather than
/// failing the connection, matching how other unparseable parameters are
/// treated.
pub fn codec_for(locator: &InvokerLocator) -> (Box<dyn Marshaller>, Box<dyn UnMarshaller>) {
    match locator.parameter(params::MARSHALLER) {
        None | Some("json") => (
            Box::new(JsonMarshaller::default()),
            Box::new(JsonMarshaller::default()),
        ),
        Some(other) => {
            tracing::warn!(codec = other, "unknown marshaller requested, using json");
            (
                Box::new(JsonMarshaller::default()),
                Box::new(JsonMarshaller::default()),
            )
        }
    }
}
