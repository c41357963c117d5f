// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Distributed mutual exclusion.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_store::{CompareDelete, KeyValueStore, SetOptions};

use crate::config::human_duration;
use crate::rnd::Rnd;
use crate::{Error, KeySpace, Result};

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(50);

/// Bounded, jittered retry of lock attempts.
///
/// `count` is the number of attempts after the first, so a policy makes `count + 1` attempts
/// in total. The wait between attempts is `delay` shifted by a uniform offset in
/// `[-jitter, +jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub count: u32,
    /// Base wait between attempts.
    #[serde(with = "human_duration")]
    pub delay: Duration,
    /// Maximum deviation from `delay`, in either direction.
    #[serde(with = "human_duration")]
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(count: u32, delay: Duration, jitter: Duration) -> Self {
        Self { count, delay, jitter }
    }

    /// Total number of attempts the policy makes.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.count.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_JITTER)
    }
}

/// Lock defaults applied by a [`LockCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct LockOptions {
    /// How long a lock lives in the store before it expires on its own.
    #[serde(with = "human_duration")]
    pub ttl: Duration,
    /// Retry policy for contended acquisitions.
    pub retry: RetryPolicy,
}

impl LockOptions {
    /// Creates options.
    #[must_use]
    pub fn new(ttl: Duration, retry: RetryPolicy) -> Self {
        Self { ttl, retry }
    }

    /// These options with `overrides` applied on top.
    #[must_use]
    pub fn apply(&self, overrides: &LockOverrides) -> Self {
        Self {
            ttl: overrides.ttl.unwrap_or(self.ttl),
            retry: RetryPolicy {
                count: overrides.retry_count.unwrap_or(self.retry.count),
                delay: overrides.retry_delay.unwrap_or(self.retry.delay),
                jitter: overrides.retry_jitter.unwrap_or(self.retry.jitter),
            },
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL, RetryPolicy::default())
    }
}

/// Per-call changes to a coordinator's [`LockOptions`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden::{LockOptions, LockOverrides};
///
/// let overrides = LockOverrides::new().ttl(Duration::from_secs(5)).retry_count(0);
/// let options = LockOptions::default().apply(&overrides);
///
/// assert_eq!(options.ttl, Duration::from_secs(5));
/// assert_eq!(options.retry.attempts(), 1);
/// assert_eq!(options.retry.delay, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockOverrides {
    ttl: Option<Duration>,
    retry_count: Option<u32>,
    retry_delay: Option<Duration>,
    retry_jitter: Option<Duration>,
}

impl LockOverrides {
    /// No overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the lock TTL.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Overrides the number of additional attempts.
    #[must_use]
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Overrides the base wait between attempts.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Overrides the jitter around the wait.
    #[must_use]
    pub fn retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = Some(jitter);
        self
    }

    /// Overrides the whole retry policy.
    #[must_use]
    pub fn retry(self, policy: RetryPolicy) -> Self {
        self.retry_count(policy.count).retry_delay(policy.delay).retry_jitter(policy.jitter)
    }
}

/// Acquires and releases named locks shared by every process using the same store.
///
/// A lock is a store key at `{prefix}:lock:{name}` holding this coordinator's owner token,
/// written with "set if absent" and a TTL. It is held while the key exists with that token.
/// Release is an atomic compare-and-delete, so a lock that expired and was taken over by
/// another owner is never released by mistake.
///
/// The owner token is generated once per coordinator. Clones share it, so tasks using clones
/// of the same coordinator are the same owner as far as release is concerned; acquisition
/// still excludes them from each other because the conditional write fails while the key
/// exists.
///
/// Multi-key acquisition takes the locks in list order. When any key is contended, the keys
/// taken in that attempt are released before waiting and retrying. Store failures are never
/// retried; they end the acquisition after cleaning up.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use warden::{KeySpace, LockCoordinator, LockOptions};
/// use warden_store::MemoryStore;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
///
/// let locks = LockCoordinator::new(Arc::new(MemoryStore::new()), KeySpace::default(), LockOptions::default());
///
/// let total = locks
///     .acquire(&["account:1", "account:2"], || async { Ok::<_, warden::Error>(40 + 2) })
///     .await?;
///
/// assert_eq!(total, 42);
/// assert!(locks.try_acquire(&["account:1"]).await);
/// # Ok(())
/// # }
/// ```
pub struct LockCoordinator<S> {
    store: Arc<S>,
    keys: KeySpace,
    token: String,
    defaults: LockOptions,
    rnd: Rnd,
}

impl<S> LockCoordinator<S> {
    /// Creates a coordinator with a fresh random owner token.
    #[must_use]
    pub fn new(store: Arc<S>, keys: KeySpace, defaults: LockOptions) -> Self {
        Self {
            store,
            keys,
            token: uuid::Uuid::new_v4().to_string(),
            defaults,
            rnd: Rnd::default(),
        }
    }

    /// Replaces the owner token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// The owner token written into every lock this coordinator takes.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Options used when a call does not override them.
    #[must_use]
    pub fn defaults(&self) -> &LockOptions {
        &self.defaults
    }

    /// The key space locks are named in.
    #[must_use]
    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    fn qualify<K: AsRef<str>>(&self, names: &[K]) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let key = self.keys.lock(name.as_ref());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

impl<S: KeyValueStore> LockCoordinator<S> {
    /// Runs `action` while holding every lock in `names`, using the default options.
    ///
    /// See [`acquire_with`](Self::acquire_with).
    ///
    /// # Errors
    ///
    /// Same as [`acquire_with`](Self::acquire_with).
    pub async fn acquire<K, F, Fut, T, E>(&self, names: &[K], action: F) -> std::result::Result<T, E>
    where
        K: AsRef<str> + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.acquire_with(names, &LockOverrides::default(), action).await
    }

    /// Runs `action` while holding every lock in `names`.
    ///
    /// Duplicate names are locked once. With no names, `action` runs immediately without any
    /// store traffic. Once the locks are held they are released however `action` finishes; an
    /// error from `action` is returned unchanged even when the release also fails.
    ///
    /// # Errors
    ///
    /// - [`Error::LockContention`] when every attempt found a lock held elsewhere
    /// - [`Error::Store`] when the store fails during acquisition or release
    /// - [`Error::LockOwnershipMismatch`] when a lock expired while `action` ran and was taken
    ///   by another owner
    /// - [`Error::Config`] for a zero lock TTL
    /// - any error returned by `action`
    pub async fn acquire_with<K, F, Fut, T, E>(&self, names: &[K], overrides: &LockOverrides, action: F) -> std::result::Result<T, E>
    where
        K: AsRef<str> + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let (outcome, released) = self.guard(names, overrides, action).await?;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(release_error)) => {
                tracing::event!(
                    name: "warden.lock.release_failed",
                    tracing::Level::WARN,
                    keys = ?self.qualify(names),
                    error = %release_error,
                    "failed to release locks after the guarded action failed"
                );
                Err(error)
            }
        }
    }

    /// Runs `action` under the locks and reports its output together with the release outcome.
    ///
    /// Fails only when the locks are not taken, in which case `action` never runs.
    pub(crate) async fn guard<K, F, Fut, T>(&self, names: &[K], overrides: &LockOverrides, action: F) -> Result<(T, Result<()>)>
    where
        K: AsRef<str> + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let keys = self.qualify(names);
        if keys.is_empty() {
            return Ok((action().await, Ok(())));
        }

        self.lock_all(&keys, &self.defaults.apply(overrides)).await?;

        let output = action().await;
        let released = self.release_keys(&keys).await;
        Ok((output, released))
    }

    /// Takes every lock in `names` using the default options, returning whether it succeeded.
    ///
    /// See [`try_acquire_with`](Self::try_acquire_with).
    pub async fn try_acquire<K: AsRef<str> + Sync>(&self, names: &[K]) -> bool {
        self.try_acquire_with(names, &LockOverrides::default()).await
    }

    /// Takes every lock in `names`, returning whether it succeeded.
    ///
    /// The locks stay held until [`release`](Self::release) or their TTL expires. Returns
    /// `false` for an empty list, once the retries are exhausted, and when the store fails;
    /// nothing stays locked in those cases.
    pub async fn try_acquire_with<K: AsRef<str> + Sync>(&self, names: &[K], overrides: &LockOverrides) -> bool {
        let keys = self.qualify(names);
        if keys.is_empty() {
            return false;
        }

        match self.lock_all(&keys, &self.defaults.apply(overrides)).await {
            Ok(()) => true,
            Err(error) => {
                tracing::event!(
                    name: "warden.lock.try_acquire_failed",
                    tracing::Level::WARN,
                    keys = ?keys,
                    error = %error,
                    "could not acquire locks"
                );
                false
            }
        }
    }

    /// Releases every lock in `names` held by this coordinator's owner token.
    ///
    /// Locks that no longer exist are skipped with a warning. Every key is attempted even
    /// after a failure.
    ///
    /// # Errors
    ///
    /// - [`Error::Store`] with the first store failure
    /// - [`Error::LockOwnershipMismatch`] listing the keys held by another owner
    pub async fn release<K: AsRef<str> + Sync>(&self, names: &[K]) -> Result<()> {
        let keys = self.qualify(names);
        self.release_keys(&keys).await
    }

    async fn lock_all(&self, keys: &[String], options: &LockOptions) -> Result<()> {
        if options.ttl.is_zero() {
            return Err(Error::Config("lock TTL must be greater than zero".to_string()));
        }

        let attempts = options.retry.attempts();
        for attempt in 1..=attempts {
            if self.lock_once(keys, options.ttl).await? {
                tracing::event!(
                    name: "warden.lock.acquired",
                    tracing::Level::DEBUG,
                    keys = ?keys,
                    attempt,
                    "locks acquired"
                );
                return Ok(());
            }

            if attempt < attempts {
                let delay = self.rnd.jittered(options.retry.delay, options.retry.jitter);
                tracing::event!(
                    name: "warden.lock.retry",
                    tracing::Level::WARN,
                    keys = ?keys,
                    attempt,
                    delay = delay.as_secs_f32(),
                    "locks contended, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::LockContention {
            keys: keys.to_vec(),
            attempts,
        })
    }

    /// One pass over `keys`; on contention or failure the keys taken in this pass are released.
    async fn lock_once(&self, keys: &[String], ttl: Duration) -> Result<bool> {
        let mut taken: Vec<&String> = Vec::with_capacity(keys.len());

        for key in keys {
            match self.store.set(key, self.token.as_bytes().to_vec(), SetOptions::if_absent(ttl)).await {
                Ok(true) => taken.push(key),
                Ok(false) => {
                    tracing::event!(
                        name: "warden.lock.attempt_failed",
                        tracing::Level::DEBUG,
                        key = %key,
                        "lock held elsewhere"
                    );
                    self.roll_back(&taken).await;
                    return Ok(false);
                }
                Err(error) => {
                    self.roll_back(&taken).await;
                    return Err(error.into());
                }
            }
        }

        Ok(true)
    }

    async fn roll_back(&self, keys: &[&String]) {
        for key in keys {
            if let Err(error) = self.store.delete_if_equals(key, self.token.as_bytes()).await {
                tracing::event!(
                    name: "warden.lock.release_failed",
                    tracing::Level::WARN,
                    key = %key,
                    error = %error,
                    "failed to release a lock taken by an unsuccessful attempt"
                );
            }
        }
    }

    async fn release_keys(&self, keys: &[String]) -> Result<()> {
        let mut mismatched = Vec::new();
        let mut failure = None;

        for key in keys {
            match self.store.delete_if_equals(key, self.token.as_bytes()).await {
                Ok(CompareDelete::Deleted) => {}
                Ok(CompareDelete::Missing) => {
                    tracing::event!(
                        name: "warden.lock.missing",
                        tracing::Level::WARN,
                        key = %key,
                        "lock already gone on release"
                    );
                }
                Ok(CompareDelete::Mismatch) => mismatched.push(key.clone()),
                Err(error) => {
                    tracing::event!(
                        name: "warden.lock.release_failed",
                        tracing::Level::WARN,
                        key = %key,
                        error = %error,
                        "failed to release lock"
                    );
                    failure.get_or_insert(error);
                }
            }
        }

        if let Some(error) = failure {
            return Err(error.into());
        }

        if !mismatched.is_empty() {
            return Err(Error::LockOwnershipMismatch { keys: mismatched });
        }

        tracing::event!(name: "warden.lock.released", tracing::Level::DEBUG, keys = ?keys, "locks released");
        Ok(())
    }
}

impl<S> Clone for LockCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            token: self.token.clone(),
            defaults: self.defaults,
            rnd: self.rnd.clone(),
        }
    }
}

impl<S> std::fmt::Debug for LockCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("keys", &self.keys)
            .field("token", &self.token)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
