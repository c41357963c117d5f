// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Warden Pipelines
//!
//! Wrap an asynchronous operation in an ordered chain of middleware.
//!
//! A [`Pipeline`] owns the wrapped operation (a function of the target instance and the call
//! input) and a list of [`Middleware`] layers. Each layer sees the input, a [`Next`]
//! continuation and the call [`Context`]; it may short-circuit, transform the result or
//! translate errors.
//!
//! ## Ordering
//!
//! Layers are added in decoration order and nest LIFO: the last layer added runs outermost.
//!
//! ```text
//! Pipeline::new(target, op).layer(a).layer(b)
//!
//! b ─▶ a ─▶ op ─▶ a ─▶ b
//! ```
//!
//! ## Testing Layers in Isolation
//!
//! A layer only depends on the continuation it is handed, so it can be exercised by wrapping a
//! stub operation:
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use warden_pipeline::{Pipeline, Retry, Target};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let calls = Arc::new(AtomicU32::new(0));
//! let pipeline = Pipeline::new(Target::new("Stub", "flaky"), |calls: Arc<AtomicU32>, (): ()| async move {
//!     if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err("not yet") } else { Ok("done") }
//! })
//! .layer(Retry::new(3, Duration::from_millis(1)));
//!
//! assert_eq!(pipeline.call(Arc::clone(&calls), ()).await, Ok("done"));
//! assert_eq!(calls.load(Ordering::SeqCst), 3);
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! Middleware must be [`Send`] and [`Sync`] and return [`Send`] futures, so pipelines can be
//! shared across tasks on multi-threaded runtimes.

mod context;
mod middleware;
mod pipeline;
mod retry;

#[doc(inline)]
pub use context::{Context, Target, kebab_case};
#[doc(inline)]
pub use middleware::{Middleware, Next};
#[doc(inline)]
pub use pipeline::Pipeline;
#[doc(inline)]
pub use retry::Retry;
