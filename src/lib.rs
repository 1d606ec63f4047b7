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

#![doc = include_str!("../README.md")]
#![allow(clippy::module_inception)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

//! # Architecture
//!
//! Backhaul is organized into layers, leaves first:
//!
//! - **[`locator`]**: immutable endpoint descriptors and configuration
//! - **[`pool`]**: the bounded LRU pool backing every resource cap
//! - **[`marshal`]**: pluggable wire codecs and length-prefixed framing
//! - **[`transport`]**: blocking stream factories and the error taxonomy
//! - **[`invocation`]**: the wire-level request/response model
//! - **[`handler`]**: capability traits applications implement
//! - **[`callback`]**: push/pull delivery with memory-bounded spooling
//! - **[`server`]**: the accept loop, worker pools, and session leases
//! - **[`client`]**: pooled client invokers, the registry, and liveness
//!   probes
//! - **[`bisocket`]**: server push through client-originated connections
//!
//! The concurrency model is deliberately blocking: one OS thread per accept
//! loop, one per active connection, one per probe timer, and the caller's
//! own thread for the duration of each invocation. Ordering and
//! backpressure guarantees follow from one worker owning one connection at
//! a time; there is no event loop to convert blocking waits into queued
//! futures, and no async runtime.

pub mod bisocket;
pub mod callback;
pub mod client;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod locator;
pub mod marshal;
pub mod pool;
pub mod server;
pub mod transport;

pub use client::{Client, InvokerRegistry};
pub use error::BackhaulError;
pub use invocation::{Callback, CallbackMode, Payload};
pub use locator::InvokerLocator;
pub use server::SocketServerInvoker;
