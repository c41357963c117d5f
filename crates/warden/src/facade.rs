// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::Serialize;
use warden_store::KeyValueStore;

use crate::{
    CacheCoordinator, Exclusive, HealthProbe, IdempotencyCoordinator, Idempotent, KeySource, KeySpace, LockCoordinator, WardenOptions,
};

/// The coordinators of one process, sharing one store and one set of options.
///
/// # Examples
///
/// ```
/// use warden::{Warden, WardenOptions};
/// use warden_store::MemoryStore;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
///
/// let warden = Warden::with_store(MemoryStore::new(), WardenOptions::default().prefix("orders"));
///
/// warden.cache().set("order:1", &"pending", None).await?;
/// assert_eq!(warden.cache().get::<String>("order:1").await?.as_deref(), Some("pending"));
/// assert!(warden.health().is_up().await);
/// # Ok(())
/// # }
/// ```
pub struct Warden<S> {
    store: Arc<S>,
    cache: CacheCoordinator<S>,
    locks: LockCoordinator<S>,
    idempotency: IdempotencyCoordinator<S>,
    health: HealthProbe<S>,
    options: WardenOptions,
}

impl<S: KeyValueStore> Warden<S> {
    /// Builds the coordinators over `store`.
    #[must_use]
    pub fn with_store(store: S, options: WardenOptions) -> Self {
        Self::with_shared_store(Arc::new(store), options)
    }

    /// Builds the coordinators over a store shared with other owners.
    #[must_use]
    pub fn with_shared_store(store: Arc<S>, options: WardenOptions) -> Self {
        let keys = KeySpace::new(options.prefix.clone());
        let cache = CacheCoordinator::new(Arc::clone(&store), keys.clone(), options.default_ttl);
        let locks = LockCoordinator::new(Arc::clone(&store), keys, options.lock);
        let idempotency = IdempotencyCoordinator::new(cache.clone(), locks.clone(), options.idempotency);
        let health = HealthProbe::new(Arc::clone(&store));

        tracing::event!(
            name: "warden.initialized",
            tracing::Level::DEBUG,
            prefix = options.prefix.as_deref().unwrap_or_default(),
            "coordinators initialized"
        );

        Self {
            store,
            cache,
            locks,
            idempotency,
            health,
            options,
        }
    }
}

#[cfg(feature = "redis")]
impl Warden<warden_redis::RedisStore> {
    /// Connects to the Redis server named by `options.connection_string`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`](crate::Error::Store) when the connection string is invalid or
    /// the server cannot be reached.
    pub async fn connect(options: WardenOptions) -> crate::Result<Self> {
        let store = warden_redis::RedisStore::connect(&options.connection_string).await?;
        Ok(Self::with_store(store, options))
    }
}

impl<S> Warden<S> {
    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The cache coordinator.
    #[must_use]
    pub fn cache(&self) -> &CacheCoordinator<S> {
        &self.cache
    }

    /// The lock coordinator.
    #[must_use]
    pub fn locks(&self) -> &LockCoordinator<S> {
        &self.locks
    }

    /// The idempotency coordinator.
    #[must_use]
    pub fn idempotency(&self) -> &IdempotencyCoordinator<S> {
        &self.idempotency
    }

    /// The store health probe.
    #[must_use]
    pub fn health(&self) -> &HealthProbe<S> {
        &self.health
    }

    /// The options the coordinators were built with.
    #[must_use]
    pub fn options(&self) -> &WardenOptions {
        &self.options
    }

    /// An [`Idempotent`] middleware keyed by `source`.
    #[must_use]
    pub fn idempotent<In>(&self, source: KeySource<In>) -> Idempotent<S, In> {
        Idempotent::new(self.idempotency.clone(), source)
    }

    /// An [`Exclusive`] middleware locking the key returned by `key`.
    #[must_use]
    pub fn exclusive<In, F>(&self, key: F) -> Exclusive<S, In>
    where
        F: Fn(&In) -> String + Send + Sync + 'static,
    {
        Exclusive::new(self.locks.clone(), key)
    }

    /// An [`Exclusive`] middleware locking the content hash of the input.
    #[must_use]
    pub fn exclusive_hashed<In: Serialize>(&self) -> Exclusive<S, In> {
        Exclusive::hashed(self.locks.clone())
    }
}

impl<S> Clone for Warden<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            locks: self.locks.clone(),
            idempotency: self.idempotency.clone(),
            health: self.health.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S> Debug for Warden<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("cache", &self.cache)
            .field("locks", &self.locks)
            .field("idempotency", &self.idempotency)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
