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

//! Endpoint locators and their configuration parameters.
//!
//! A [`InvokerLocator`] is the immutable descriptor of a remote endpoint:
//! transport, host, port, path, and an open-ended parameter map parsed from a
//! `transport://host:port/path?key=value` string. Locators are the cache key
//! for invoker reuse, so equality is by *logical* endpoint rather than by the
//! literal string they were parsed from.
//!
//! The [`params`] module defines the parameter keys the runtime itself
//! consumes, with typed accessors and defaults. Unknown keys are preserved
//! opaquely for transport-specific consumers.

mod locator;
pub mod params;

pub use locator::{InvokerLocator, LocatorError};
