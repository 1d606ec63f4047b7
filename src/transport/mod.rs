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

//! Blocking stream transports.
//!
//! Invokers never open sockets themselves: they go through a
//! [`ConnectionFactory`], so SSL and other stream flavors are alternative
//! factory implementations selected by configuration rather than invoker
//! subclasses. The default factory is [`PlainConnectionFactory`].

mod error;
mod tcp;
mod traits;

pub use error::TransportError;
pub use tcp::{peer_alive, PlainConnectionFactory};
pub use traits::ConnectionFactory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one physical connection, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Creates the next process-unique connection identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The identity as a raw integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}
