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

//! Server-side callback delivery.
//!
//! Each registered listener is represented by a [`CallbackDispatcher`] that
//! knows the listener's delivery mode. Push mode delivers immediately over a
//! [`CallbackSink`] (a plain socket or a bisocket control connection); pull
//! mode queues into the listener's [`CallbackStore`] until the client polls.
//! Either way, callbacks generated for one listener reach it in generation
//! order: a failed push diverts delivery through the store, and later
//! deliveries drain the store before going direct again.
//!
//! The default [`InMemoryCallbackStore`] blocks producers at a configured
//! memory ceiling, deliberately trading producer stalls for bounded memory.
//! [`DiskCallbackStore`] offers the same contract with entries spooled to
//! disk, surviving a restart of the waiting period.

mod dispatcher;
mod disk;
mod error;
mod store;

pub use dispatcher::{CallbackDispatcher, CallbackSink};
pub use disk::DiskCallbackStore;
pub use error::CallbackError;
pub use store::{estimate_size, CallbackStore, InMemoryCallbackStore};
