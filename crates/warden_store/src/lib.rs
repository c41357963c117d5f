// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Key-value store contract for the warden coordination layer.
//!
//! This crate defines the [`KeyValueStore`] trait that every backing store must satisfy,
//! the [`Batch`] of commands submitted as one pipelined request, and the [`StoreError`]
//! returned by fallible store operations.
//!
//! # Overview
//!
//! The warden coordinators (cache, locks, idempotency) never talk to a concrete engine.
//! They speak the narrow contract below, which mirrors the command set of Redis-compatible
//! servers:
//!
//! - plain values: `get`, `set` (optionally conditional and with a TTL), `del`, `exists`,
//!   `expire`, `ttl`, `mget`
//! - sets: `sadd`, `srem`, `smismember`, cursor-paginated `sscan`
//! - [`exec`][KeyValueStore::exec] for best-effort pipelined batches
//! - [`delete_if_equals`][KeyValueStore::delete_if_equals] for atomic compare-and-delete
//!
//! TTL expiry is always enforced by the store itself, never by client timers.
//!
//! # In-Process Store
//!
//! With the `memory` feature (enabled by default) the crate ships [`MemoryStore`], a complete
//! in-process implementation. It records every operation and supports failure injection, which
//! makes it the store of choice for tests:
//!
//! ```
//! use std::time::Duration;
//! use warden_store::{KeyValueStore, MemoryStore, SetOptions};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), warden_store::StoreError> {
//!
//! let store = MemoryStore::new();
//!
//! store.set("greeting", b"hello".to_vec(), SetOptions::ttl(Duration::from_secs(60))).await?;
//! assert_eq!(store.get("greeting").await?, Some(b"hello".to_vec()));
//! # Ok(())
//! # }
//! ```

mod batch;
pub mod error;
#[cfg(feature = "memory")]
mod memory;
mod store;

#[doc(inline)]
pub use batch::{Batch, Command};
#[doc(inline)]
pub use error::{Result, StoreError};
#[cfg(feature = "memory")]
#[doc(inline)]
pub use memory::{MemoryStore, StoreOp};
#[doc(inline)]
pub use store::{CompareDelete, KeyValueStore, SCAN_EXHAUSTED, ScanPage, SetOptions, TTL_MISSING, TTL_NO_EXPIRY};
