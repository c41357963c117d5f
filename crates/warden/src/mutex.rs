// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mutual exclusion middleware.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use warden_pipeline::{Context, Middleware, Next};
use warden_store::KeyValueStore;

use crate::{Error, IdempotencyKey, LockCoordinator, LockOverrides, Result};

type LockName<In> = dyn Fn(&In) -> Result<String> + Send + Sync;

/// Middleware that runs the rest of the pipeline while holding a lock derived from the input.
///
/// The lock is named `{scope}:{key}`, where the scope is the kebab-cased type name of the
/// pipeline's target, so every operation of one type sharing a key excludes the others. A
/// call that cannot take the lock within the retry budget fails with
/// [`Error::LockContention`] without running the operation. The lock is released however the
/// operation finishes.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use warden::{Warden, WardenOptions};
/// use warden_pipeline::{Pipeline, Target};
/// use warden_store::MemoryStore;
///
/// struct Inventory;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
/// let warden = Warden::with_store(MemoryStore::new(), WardenOptions::default());
///
/// let reserve = Pipeline::new(Target::of::<Inventory>("reserve"), |_: Arc<Inventory>, sku: String| async move {
///     Ok::<_, warden::Error>(format!("reserved {sku}"))
/// })
/// .layer(warden.exclusive(|sku: &String| sku.clone()));
///
/// assert_eq!(reserve.call(Arc::new(Inventory), "sku-1".to_string()).await?, "reserved sku-1");
/// # Ok(())
/// # }
/// ```
pub struct Exclusive<S, In> {
    locks: LockCoordinator<S>,
    name: Arc<LockName<In>>,
    overrides: LockOverrides,
}

impl<S, In> Exclusive<S, In> {
    /// Locks the key returned by `key` for each call.
    #[must_use]
    pub fn new<F>(locks: LockCoordinator<S>, key: F) -> Self
    where
        F: Fn(&In) -> String + Send + Sync + 'static,
    {
        Self {
            locks,
            name: Arc::new(move |input: &In| Ok::<_, Error>(key(input))),
            overrides: LockOverrides::default(),
        }
    }

    /// Locks the content hash of each call's input.
    #[must_use]
    pub fn hashed(locks: LockCoordinator<S>) -> Self
    where
        In: Serialize,
    {
        Self {
            locks,
            name: Arc::new(|input: &In| IdempotencyKey::content_hash(input).map(|key| key.as_str().to_string())),
            overrides: LockOverrides::default(),
        }
    }

    /// Replaces the lock options for this middleware.
    #[must_use]
    pub fn overrides(mut self, overrides: LockOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

impl<S, In> Clone for Exclusive<S, In> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            name: Arc::clone(&self.name),
            overrides: self.overrides,
        }
    }
}

impl<S, In> Debug for Exclusive<S, In> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exclusive")
            .field("locks", &self.locks)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

impl<Svc, S, In, T, E> Middleware<Svc, In, std::result::Result<T, E>> for Exclusive<S, In>
where
    Svc: Send + Sync + 'static,
    S: KeyValueStore + 'static,
    In: Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        input: In,
        next: Next<'a, Svc, In, std::result::Result<T, E>>,
        context: &'a Context<Svc>,
    ) -> BoxFuture<'a, std::result::Result<T, E>> {
        Box::pin(async move {
            let key = match (self.name)(&input) {
                Ok(key) => key,
                Err(error) => return Err(error.into()),
            };
            let name = format!("{}:{key}", context.target().scope());

            self.locks.acquire_with(&[name.as_str()], &self.overrides, || next.run(input)).await
        })
    }
}
