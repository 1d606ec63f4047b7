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

//! Bounded, keyed pools with least-recently-used ordering.
//!
//! One structure backs both sides of the server's worker bookkeeping: the
//! busy pool (keyed by connection, blocking at capacity so new connections
//! feel backpressure) and the free list (keyed by worker identity, evicting
//! the coldest worker at capacity). The client's reusable-connection pool is
//! a third instance in evict mode.

mod lru;

pub use lru::{LruPool, OverflowPolicy, PoolError};
