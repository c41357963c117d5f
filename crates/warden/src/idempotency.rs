// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! At-most-once execution of logical operations.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use warden_pipeline::{Context, Middleware, Next, kebab_case};
use warden_store::KeyValueStore;

use crate::config::human_duration;
use crate::{CacheCoordinator, Error, LockCoordinator, LockOverrides, Result, RetryPolicy, codec};

const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_COUNT: u32 = 50;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(50);

/// Idempotency defaults applied by an [`IdempotencyCoordinator`].
///
/// The default retry policy keeps a waiting caller retrying for roughly as long as the default
/// lock TTL, so it outlasts a first caller that finishes within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct IdempotencyOptions {
    /// How long a result stays replayable.
    #[serde(with = "human_duration")]
    pub result_ttl: Duration,
    /// TTL of the lock held while the operation runs.
    #[serde(with = "human_duration")]
    pub lock_ttl: Duration,
    /// Retry policy of callers waiting for the lock.
    pub retry: RetryPolicy,
}

impl IdempotencyOptions {
    /// Creates options.
    #[must_use]
    pub fn new(result_ttl: Duration, lock_ttl: Duration, retry: RetryPolicy) -> Self {
        Self { result_ttl, lock_ttl, retry }
    }
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self::new(
            DEFAULT_RESULT_TTL,
            DEFAULT_LOCK_TTL,
            RetryPolicy::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_JITTER),
        )
    }
}

/// Identifies one logical operation within a scope.
///
/// # Examples
///
/// ```
/// use warden::IdempotencyKey;
///
/// let explicit = IdempotencyKey::explicit("req-8c1f");
/// assert_eq!(explicit.as_str(), "req-8c1f");
///
/// let first = IdempotencyKey::content_hash(&("order", 17))?;
/// let second = IdempotencyKey::content_hash(&("order", 17))?;
/// assert_eq!(first, second);
/// assert_eq!(first.as_str().len(), 32);
/// # Ok::<(), warden::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// A key supplied by the caller, typically from a request header.
    #[must_use]
    pub fn explicit(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// A key derived from the content of `value`.
    ///
    /// Equal values produce equal keys regardless of map ordering: the value is encoded with
    /// sorted object keys and hashed with 128-bit XXH3, rendered as 32 hex digits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the value cannot be encoded.
    pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = codec::encode_canonical(value)?;
        let hash = xxhash_rust::xxh3::xxh3_128(&bytes);
        Ok(Self(format!("{hash:032x}")))
    }

    /// The key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs each logical operation at most once per idempotency window.
///
/// An operation is identified by a scope and an [`IdempotencyKey`]. Its result is cached at
/// `{scope}:{key}:result` for the configured result TTL; while it runs, the lock
/// `{scope}:{key}` keeps other callers waiting. Callers therefore either replay the cached
/// result or wait on the lock until the first caller finishes.
///
/// A failing operation caches nothing; its error is returned unchanged and the next caller
/// runs the operation again. Failing to take the lock surfaces as
/// [`Error::LockContention`], distinct from the operation's own errors.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use warden::{IdempotencyKey, Warden, WardenOptions};
/// use warden_store::MemoryStore;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
///
/// let warden = Warden::with_store(MemoryStore::new(), WardenOptions::default());
/// let charges = AtomicU32::new(0);
/// let key = IdempotencyKey::explicit("payment-42");
///
/// for _ in 0..3 {
///     let receipt: u32 = warden
///         .idempotency()
///         .execute("billing:charge", &key, || async { Ok::<_, warden::Error>(charges.fetch_add(1, Ordering::SeqCst) + 1) })
///         .await?;
///     assert_eq!(receipt, 1);
/// }
///
/// assert_eq!(charges.load(Ordering::SeqCst), 1);
/// # Ok(())
/// # }
/// ```
pub struct IdempotencyCoordinator<S> {
    cache: CacheCoordinator<S>,
    locks: LockCoordinator<S>,
    options: IdempotencyOptions,
}

impl<S> IdempotencyCoordinator<S> {
    /// Creates a coordinator over the given cache and locks.
    #[must_use]
    pub fn new(cache: CacheCoordinator<S>, locks: LockCoordinator<S>, options: IdempotencyOptions) -> Self {
        Self { cache, locks, options }
    }

    /// The options in effect.
    #[must_use]
    pub fn options(&self) -> &IdempotencyOptions {
        &self.options
    }
}

impl<S: KeyValueStore> IdempotencyCoordinator<S> {
    /// Returns the result of the operation identified by `scope` and `key`, running
    /// `operation` only when no result is cached.
    ///
    /// Once the operation has run, its outcome is returned even when the result cannot be
    /// cached or the lock cannot be released; both failures are logged.
    ///
    /// # Errors
    ///
    /// Returns the operation's errors unchanged, [`Error::LockContention`] when the lock
    /// could not be taken within the retry budget, and other coordinator [`Error`]s converted
    /// into `E`.
    pub async fn execute<T, F, Fut, E>(&self, scope: &str, key: &IdempotencyKey, operation: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let request = format!("{scope}:{key}");
        let result_key = format!("{request}:result");

        if let Some(value) = self.cache.get(&result_key).await? {
            tracing::event!(name: "warden.idempotency.replayed", tracing::Level::DEBUG, request = %request, "cached result replayed");
            return Ok(value);
        }

        let overrides = LockOverrides::new().ttl(self.options.lock_ttl).retry(self.options.retry);

        let (outcome, released) = self
            .locks
            .guard(&[request.as_str()], &overrides, || self.run_locked(&request, &result_key, operation))
            .await?;

        // the outcome stands either way; a lock left behind expires with its TTL
        if let Err(error) = released {
            tracing::event!(
                name: "warden.idempotency.release_failed",
                tracing::Level::WARN,
                request = %request,
                error = %error,
                "idempotency lock could not be released"
            );
        }

        outcome
    }

    async fn run_locked<T, F, Fut, E>(&self, request: &str, result_key: &str, operation: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        // a racing caller may have finished between the first lookup and the lock
        if let Some(value) = self.cache.get(result_key).await? {
            tracing::event!(name: "warden.idempotency.replayed", tracing::Level::DEBUG, request, "cached result replayed");
            return Ok(value);
        }

        let value = operation().await?;

        let encoded = codec::encode(&value);
        let written = match encoded {
            Ok(bytes) => self.cache.set_encoded(result_key, bytes, Some(self.options.result_ttl)).await,
            Err(error) => Err(error),
        };

        if let Err(error) = written {
            tracing::event!(
                name: "warden.idempotency.cache_write_failed",
                tracing::Level::WARN,
                request,
                error = %error,
                "operation succeeded but its result could not be cached"
            );
        }

        tracing::event!(name: "warden.idempotency.executed", tracing::Level::DEBUG, request, "operation executed");
        Ok(value)
    }
}

impl<S> Clone for IdempotencyCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            locks: self.locks.clone(),
            options: self.options,
        }
    }
}

impl<S> Debug for IdempotencyCoordinator<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("cache", &self.cache)
            .field("locks", &self.locks)
            .field("options", &self.options)
            .finish()
    }
}

/// Supplies the caller's explicit idempotency key for the current request.
///
/// Implemented for closures returning `Option<String>`.
pub trait IdempotencyKeyProvider: Send + Sync {
    /// The key of the request being served, if the caller supplied one.
    fn idempotency_key(&self) -> Option<String>;
}

impl<F> IdempotencyKeyProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn idempotency_key(&self) -> Option<String> {
        self()
    }
}

type ArgumentKey<In> = dyn Fn(&In) -> Result<IdempotencyKey> + Send + Sync;

/// Where the [`Idempotent`] middleware takes its key from.
pub enum KeySource<In> {
    /// The caller's explicit key. Calls without one are not deduplicated.
    RequestContext(Arc<dyn IdempotencyKeyProvider>),
    /// A key derived from the call input.
    Argument(Arc<ArgumentKey<In>>),
}

impl<In> KeySource<In> {
    /// Reads explicit keys from `provider`.
    #[must_use]
    pub fn request_context(provider: impl IdempotencyKeyProvider + 'static) -> Self {
        Self::RequestContext(Arc::new(provider))
    }

    /// Hashes the part of the input returned by `select`.
    ///
    /// ```
    /// use warden::KeySource;
    ///
    /// struct Transfer {
    ///     reference: String,
    /// }
    ///
    /// let source = KeySource::argument(|transfer: &Transfer| &transfer.reference);
    /// # let _ = source;
    /// ```
    #[must_use]
    pub fn argument<F, A>(select: F) -> Self
    where
        F: Fn(&In) -> &A + Send + Sync + 'static,
        A: Serialize + ?Sized,
    {
        Self::Argument(Arc::new(move |input: &In| IdempotencyKey::content_hash(select(input))))
    }

    /// Hashes the whole input.
    #[must_use]
    pub fn whole_input() -> Self
    where
        In: Serialize,
    {
        Self::Argument(Arc::new(|input: &In| IdempotencyKey::content_hash(input)))
    }

    fn resolve(&self, input: &In) -> Result<Option<IdempotencyKey>> {
        match self {
            Self::RequestContext(provider) => Ok(provider.idempotency_key().map(IdempotencyKey::explicit)),
            Self::Argument(derive) => derive(input).map(Some),
        }
    }
}

impl<In> Clone for KeySource<In> {
    fn clone(&self) -> Self {
        match self {
            Self::RequestContext(provider) => Self::RequestContext(Arc::clone(provider)),
            Self::Argument(derive) => Self::Argument(Arc::clone(derive)),
        }
    }
}

impl<In> Debug for KeySource<In> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestContext(_) => write!(f, "RequestContext"),
            Self::Argument(_) => write!(f, "Argument"),
        }
    }
}

/// Middleware running the rest of the pipeline through an [`IdempotencyCoordinator`].
///
/// The scope is the kebab-cased type and method of the pipeline's target, for example
/// `order-service:place-order`, so equal keys used by different operations never collide.
/// The wrapped operation's output must be serializable because it is cached.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use warden::{KeySource, Warden, WardenOptions};
/// use warden_pipeline::{Pipeline, Target};
/// use warden_store::MemoryStore;
///
/// struct Orders {
///     placed: AtomicU32,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
/// let warden = Warden::with_store(MemoryStore::new(), WardenOptions::default());
///
/// let place = Pipeline::new(Target::of::<Orders>("place"), |orders: Arc<Orders>, sku: String| async move {
///     Ok::<_, warden::Error>(format!("{sku}#{}", orders.placed.fetch_add(1, Ordering::SeqCst)))
/// })
/// .layer(warden.idempotent(KeySource::whole_input()));
///
/// let orders = Arc::new(Orders { placed: AtomicU32::new(0) });
/// let first = place.call(Arc::clone(&orders), "sku-1".to_string()).await?;
/// let second = place.call(Arc::clone(&orders), "sku-1".to_string()).await?;
///
/// assert_eq!(first, second);
/// assert_eq!(orders.placed.load(Ordering::SeqCst), 1);
/// # Ok(())
/// # }
/// ```
pub struct Idempotent<S, In> {
    coordinator: IdempotencyCoordinator<S>,
    source: KeySource<In>,
}

impl<S, In> Idempotent<S, In> {
    /// Creates the middleware.
    #[must_use]
    pub fn new(coordinator: IdempotencyCoordinator<S>, source: KeySource<In>) -> Self {
        Self { coordinator, source }
    }
}

impl<S, In> Clone for Idempotent<S, In> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            source: self.source.clone(),
        }
    }
}

impl<S, In> Debug for Idempotent<S, In> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idempotent")
            .field("coordinator", &self.coordinator)
            .field("source", &self.source)
            .finish()
    }
}

impl<Svc, S, In, T, E> Middleware<Svc, In, std::result::Result<T, E>> for Idempotent<S, In>
where
    Svc: Send + Sync + 'static,
    S: KeyValueStore + 'static,
    In: Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    E: From<Error> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        input: In,
        next: Next<'a, Svc, In, std::result::Result<T, E>>,
        context: &'a Context<Svc>,
    ) -> BoxFuture<'a, std::result::Result<T, E>> {
        Box::pin(async move {
            let key = match self.source.resolve(&input) {
                Ok(Some(key)) => key,
                Ok(None) => return next.run(input).await,
                Err(error) => return Err(error.into()),
            };

            let target = context.target();
            let scope = format!("{}:{}", target.scope(), kebab_case(target.method()));

            self.coordinator.execute(&scope, &key, || next.run(input)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn content_hash_is_order_independent() {
        let first = HashMap::from([("b", 2), ("a", 1)]);
        let second = HashMap::from([("a", 1), ("b", 2)]);

        assert_eq!(
            IdempotencyKey::content_hash(&first).unwrap(),
            IdempotencyKey::content_hash(&second).unwrap()
        );
    }

    #[test]
    fn content_hash_distinguishes_values() {
        assert_ne!(
            IdempotencyKey::content_hash(&1).unwrap(),
            IdempotencyKey::content_hash(&2).unwrap()
        );
    }

    #[test]
    fn request_context_without_key_resolves_to_none() {
        let source: KeySource<u32> = KeySource::request_context(|| None::<String>);

        assert_eq!(source.resolve(&1).unwrap(), None);
    }

    #[test]
    fn request_context_key_is_explicit() {
        let source: KeySource<u32> = KeySource::request_context(|| Some("req-1".to_string()));

        assert_eq!(source.resolve(&1).unwrap(), Some(IdempotencyKey::explicit("req-1")));
    }

    #[test]
    fn argument_hashes_selected_part() {
        let source: KeySource<(String, u32)> = KeySource::argument(|input: &(String, u32)| &input.0);

        let first = source.resolve(&("ref".to_string(), 1)).unwrap();
        let second = source.resolve(&("ref".to_string(), 2)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, Some(IdempotencyKey::content_hash("ref").unwrap()));
    }

    #[test]
    fn default_options() {
        let options = IdempotencyOptions::default();

        assert_eq!(options.result_ttl, Duration::from_secs(60));
        assert_eq!(options.lock_ttl, Duration::from_secs(5));
        assert_eq!(options.retry.count, 50);
    }
}
