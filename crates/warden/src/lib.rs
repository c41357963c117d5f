// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Distributed caching, locking and idempotency for processes sharing one key-value store.
//!
//! Many independent service processes coordinate through a single remote store (Redis or a
//! compatible server). This crate provides the client side of that coordination:
//!
//! - [`CacheCoordinator`]: cache-aside reads, tag-indexed entries and bulk tag invalidation,
//!   including batched resolution of many keys with a single resolver call
//! - [`LockCoordinator`]: named locks with TTL-bound owner tokens, taken with bounded,
//!   jittered retry and released by compare-and-delete
//! - [`IdempotencyCoordinator`]: at-most-once execution per logical operation, combining the
//!   two above (cached results plus single-flight locking)
//!
//! The [`Idempotent`] and [`Exclusive`] middleware plug the coordinators into a
//! [`warden_pipeline::Pipeline`], next to the pipeline crate's own `Retry` layer.
//!
//! # Getting Started
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden::{CacheAsideOptions, Warden, WardenOptions};
//! use warden_store::MemoryStore;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), warden::Error> {
//!
//! // `Warden::connect(options)` talks to Redis; tests and examples use the in-process store
//! let warden = Warden::with_store(MemoryStore::new(), WardenOptions::default().prefix("app"));
//!
//! let profile: Option<String> = warden
//!     .cache()
//!     .cache_aside(
//!         "user:1",
//!         || async { Ok::<_, warden::Error>(Some("ada".to_string())) },
//!         &CacheAsideOptions::new().ttl(Duration::from_secs(60)).tag("users"),
//!     )
//!     .await?;
//! assert_eq!(profile.as_deref(), Some("ada"));
//!
//! let total = warden.locks().acquire(&["account:1"], || async { Ok::<_, warden::Error>(42) }).await?;
//! assert_eq!(total, 42);
//! # Ok(())
//! # }
//! ```
//!
//! # Keys
//!
//! All keys live in a [`KeySpace`]: entries at `{prefix}:{key}`, tag indexes at
//! `{prefix}:tag:{tag}` and locks at `{prefix}:lock:{name}`, or without the prefix segment
//! when no prefix is configured.
//!
//! # Errors
//!
//! Coordinator failures are [`Error`]s. Code supplied by callers (resolvers, guarded actions,
//! wrapped operations) returns its own error type `E: From<Error>`; its errors pass through
//! untouched, and lock contention stays distinguishable from them.
//!
//! # Configuration
//!
//! [`WardenOptions`] deserializes from camelCase documents with human-readable durations
//! (`"1 minute"`, `"100ms"`) and can be read from `WARDEN_*` environment variables with
//! [`WardenOptions::from_env`].
//!
//! # Logging
//!
//! The crate emits [`tracing`] events named `warden.<component>.<event>`, for example
//! `warden.lock.retry` and `warden.cache.miss`. It never installs a subscriber.

mod cache;
mod codec;
mod config;
mod error;
mod facade;
mod health;
mod idempotency;
mod key;
mod lock;
mod mutex;
mod rnd;

#[doc(inline)]
pub use cache::{CacheAsideOptions, CacheCoordinator, RemainingTime};
pub use codec::{decode, encode};
#[doc(inline)]
pub use config::{HumanDuration, WardenOptions};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use facade::Warden;
#[doc(inline)]
pub use health::{HealthProbe, HealthStatus};
#[doc(inline)]
pub use idempotency::{IdempotencyCoordinator, IdempotencyKey, IdempotencyKeyProvider, IdempotencyOptions, Idempotent, KeySource};
#[doc(inline)]
pub use key::{CacheKey, KeySpace};
#[doc(inline)]
pub use lock::{LockCoordinator, LockOptions, LockOverrides, RetryPolicy};
#[doc(inline)]
pub use mutex::Exclusive;
#[cfg(feature = "redis")]
#[doc(inline)]
pub use warden_redis::RedisStore;
