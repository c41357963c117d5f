// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache-aside caching with tag-based invalidation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use warden_store::{Batch, KeyValueStore, SCAN_EXHAUSTED, SetOptions, TTL_MISSING, TTL_NO_EXPIRY};

use crate::{CacheKey, Error, KeySpace, Result, codec};

/// Page size used when scanning a tag's member set.
const TAG_SCAN_PAGE: usize = 100;

/// How long a cache entry has left to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingTime {
    /// The key does not exist.
    Miss,
    /// The key exists and never expires.
    Infinite,
    /// The key expires after this long (whole seconds).
    Remaining(Duration),
}

/// Options for [`CacheCoordinator::cache_aside`] and [`CacheCoordinator::batch_cache_aside`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden::CacheAsideOptions;
///
/// let options = CacheAsideOptions::new().ttl(Duration::from_secs(60)).tag("users").tag("tenant:7");
///
/// assert_eq!(options.tag_names(), ["users", "tenant:7"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheAsideOptions {
    ttl: Option<Duration>,
    tags: Vec<String>,
}

impl CacheAsideOptions {
    /// Default TTL, no tags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL of written entries; zero writes entries that never expire.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds a tag assigned to every written entry.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds several tags.
    #[must_use]
    pub fn tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// The tags assigned to written entries.
    #[must_use]
    pub fn tag_names(&self) -> &[String] {
        &self.tags
    }

    /// The TTL override, if any.
    #[must_use]
    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Cache-aside reads and writes of serialized values, indexed by tags.
///
/// Every key is a logical name qualified by the [`KeySpace`]. A write stores the value and its
/// TTL in a single atomic command. Writes without a TTL use the coordinator's default; a zero
/// TTL stores an entry that never expires.
///
/// Tags are reverse indexes: the set at `{prefix}:tag:{tag}` holds the qualified keys of every
/// entry carrying the tag, so [`delete_by_tags`](Self::delete_by_tags) can drop them in bulk.
///
/// Concurrent [`cache_aside`](Self::cache_aside) calls for the same missing key each run their
/// resolver. Use the [`IdempotencyCoordinator`](crate::IdempotencyCoordinator) when only one
/// of them may run.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use warden::{CacheAsideOptions, CacheCoordinator, KeySpace};
/// use warden_store::MemoryStore;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden::Error> {
///
/// let cache = CacheCoordinator::new(Arc::new(MemoryStore::new()), KeySpace::new(Some("app")), Duration::from_secs(3600));
/// let options = CacheAsideOptions::new().ttl(Duration::from_secs(60)).tag("users");
///
/// let name: Option<String> = cache
///     .cache_aside("user:1", || async { Ok::<_, warden::Error>(Some("ada".to_string())) }, &options)
///     .await?;
/// assert_eq!(cache.get::<String>("user:1").await?, name);
///
/// cache.delete_by_tags(&["users"]).await?;
/// assert_eq!(cache.get::<String>("user:1").await?, None);
/// # Ok(())
/// # }
/// ```
pub struct CacheCoordinator<S> {
    store: Arc<S>,
    keys: KeySpace,
    default_ttl: Duration,
}

impl<S> CacheCoordinator<S> {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(store: Arc<S>, keys: KeySpace, default_ttl: Duration) -> Self {
        Self { store, keys, default_ttl }
    }

    /// TTL of entries written without one.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The key space entries are named in.
    #[must_use]
    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        Some(ttl.unwrap_or(self.default_ttl)).filter(|ttl| !ttl.is_zero())
    }

    fn entries<K: AsRef<str>>(&self, keys: &[K]) -> Vec<String> {
        keys.iter().map(|key| self.keys.entry(key.as_ref())).collect()
    }
}

impl<S: KeyValueStore> CacheCoordinator<S> {
    /// Returns `true` when the entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.store.exists(&[self.keys.entry(key)]).await? > 0)
    }

    /// Reads an entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails and [`Error::Codec`] when the stored value
    /// is not a `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(&self.keys.entry(key)).await? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads an entry through a typed key.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &CacheKey<T>) -> Result<Option<T>> {
        self.get(key.as_str()).await
    }

    /// Writes an entry; `None` uses the default TTL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the value cannot be encoded and [`Error::Store`] when the
    /// store fails.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = codec::encode(value)?;
        self.set_encoded(key, bytes, ttl).await
    }

    /// Writes an already encoded entry; the future holds no reference to the original value.
    pub(crate) async fn set_encoded(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let options = SetOptions {
            ttl: self.effective_ttl(ttl),
            only_if_absent: false,
        };

        self.store.set(&self.keys.entry(key), bytes, options).await?;
        Ok(())
    }

    /// Writes an entry through a typed key.
    ///
    /// # Errors
    ///
    /// Same as [`set`](Self::set).
    pub async fn set_typed<T: Serialize>(&self, key: &CacheKey<T>, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key.as_str(), value, ttl).await
    }

    /// Deletes entries, returning how many existed. An empty list is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn delete<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        Ok(self.store.del(&self.entries(keys)).await?)
    }

    /// Adds raw members to the set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn set_add(&self, key: &str, members: &[String]) -> Result<u64> {
        Ok(self.store.sadd(&self.keys.entry(key), members).await?)
    }

    /// Reports which members belong to the set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn set_has(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        Ok(self.store.smismember(&self.keys.entry(key), members).await?)
    }

    /// Removes members from the set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn set_delete(&self, key: &str, members: &[String]) -> Result<u64> {
        Ok(self.store.srem(&self.keys.entry(key), members).await?)
    }

    /// Resets an entry's TTL, returning `false` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store.expire(&self.keys.entry(key), ttl).await?)
    }

    /// How long an entry has left to live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn remaining_time(&self, key: &str) -> Result<RemainingTime> {
        let ttl = self.store.ttl(&self.keys.entry(key)).await?;

        Ok(match ttl {
            TTL_NO_EXPIRY => RemainingTime::Infinite,
            TTL_MISSING => RemainingTime::Miss,
            secs => u64::try_from(secs).map_or(RemainingTime::Miss, |secs| RemainingTime::Remaining(Duration::from_secs(secs))),
        })
    }

    /// Adds every entry in `keys` to every tag in `tags`, in one batch.
    ///
    /// Does nothing when either list is empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails.
    pub async fn assign_tags<K, T>(&self, keys: &[K], tags: &[T]) -> Result<()>
    where
        K: AsRef<str> + Sync,
        T: AsRef<str> + Sync,
    {
        if keys.is_empty() || tags.is_empty() {
            return Ok(());
        }

        let entries = self.entries(keys);
        let batch = tags
            .iter()
            .fold(Batch::new(), |batch, tag| batch.sadd(self.keys.tag(tag.as_ref()), entries.clone()));

        Ok(self.store.exec(batch).await?)
    }

    /// Deletes every entry carrying any of `tags`, then the tag indexes themselves.
    ///
    /// Returns the number of entries deleted. Tags without members are fine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the store fails; entries deleted before the failure stay
    /// deleted.
    pub async fn delete_by_tags<T: AsRef<str> + Sync>(&self, tags: &[T]) -> Result<u64> {
        if tags.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        let mut tag_keys = Vec::with_capacity(tags.len());

        for tag in tags {
            let tag_key = self.keys.tag(tag.as_ref());
            let mut cursor = SCAN_EXHAUSTED.to_string();

            loop {
                let page = self.store.sscan(&tag_key, &cursor, TAG_SCAN_PAGE).await?;
                if !page.members.is_empty() {
                    deleted += self.store.del(&page.members).await?;
                }
                if page.is_last() {
                    break;
                }
                cursor = page.cursor;
            }

            tag_keys.push(tag_key);
        }

        self.store.del(&tag_keys).await?;

        tracing::event!(
            name: "warden.cache.tags_deleted",
            tracing::Level::DEBUG,
            tags = ?tag_keys,
            deleted,
            "tagged entries deleted"
        );

        Ok(deleted)
    }

    /// Returns the cached entry at `key`, or resolves, caches and returns it.
    ///
    /// This is the single-key form of [`batch_cache_aside`](Self::batch_cache_aside): a
    /// resolver returning `None` reports that nothing exists for the key, so nothing is cached
    /// and the next call resolves again. Errors from `resolver` are returned unchanged and
    /// nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns the resolver's errors and coordinator [`Error`]s converted into `E`.
    pub async fn cache_aside<T, F, Fut, E>(
        &self,
        key: &str,
        resolver: F,
        options: &CacheAsideOptions,
    ) -> std::result::Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: From<Error>,
    {
        if let Some(value) = self.get(key).await? {
            tracing::event!(name: "warden.cache.hit", tracing::Level::DEBUG, key, "cache hit");
            return Ok(Some(value));
        }

        tracing::event!(name: "warden.cache.miss", tracing::Level::DEBUG, key, "cache miss");

        let Some(value) = resolver().await? else {
            return Ok(None);
        };

        let entry = self.keys.entry(key);
        let batch = options
            .tags
            .iter()
            .fold(Batch::new().set(entry.clone(), codec::encode(&value)?, self.effective_ttl(options.ttl)), |batch, tag| {
                batch.sadd(self.keys.tag(tag), vec![entry.clone()])
            });

        self.store.exec(batch).await.map_err(Error::from)?;
        Ok(Some(value))
    }

    /// Resolves many entries at once, calling `resolver` only for the ones not cached.
    ///
    /// `key_fn` derives the logical key of each parameter. Cached entries are read with one
    /// multi-get. The resolver runs at most once, with the missing parameters in their
    /// original order, and returns one optional value per parameter it received. Resolved
    /// values are written back (with TTL and tags) in one batch; `None` results are not
    /// cached.
    ///
    /// The returned vector lines up with `params`. An empty `params` returns an empty vector
    /// without calling `resolver`. A resolver returning fewer values than it was given leaves
    /// the remaining positions `None`; extra values are ignored.
    ///
    /// # Errors
    ///
    /// Returns the resolver's errors unchanged (nothing is cached) and coordinator [`Error`]s
    /// converted into `E`.
    pub async fn batch_cache_aside<P, T, K, F, Fut, E>(
        &self,
        params: Vec<P>,
        key_fn: K,
        resolver: F,
        options: &CacheAsideOptions,
    ) -> std::result::Result<Vec<Option<T>>, E>
    where
        T: Serialize + DeserializeOwned,
        K: Fn(&P) -> String,
        F: FnOnce(Vec<P>) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Option<T>>, E>>,
        E: From<Error>,
    {
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = params.iter().map(|param| self.keys.entry(&key_fn(param))).collect();
        let mut cached = self.store.mget(&keys).await.map_err(Error::from)?.into_iter();

        let mut results: Vec<Option<T>> = Vec::with_capacity(params.len());
        let mut missing_indexes = Vec::new();
        let mut missing_params = Vec::new();

        for (index, param) in params.into_iter().enumerate() {
            match cached.next().flatten() {
                Some(bytes) => results.push(Some(codec::decode(&bytes)?)),
                None => {
                    results.push(None);
                    missing_indexes.push(index);
                    missing_params.push(param);
                }
            }
        }

        tracing::event!(
            name: "warden.cache.batch",
            tracing::Level::DEBUG,
            hits = results.len() - missing_indexes.len(),
            misses = missing_indexes.len(),
            "batch cache lookup"
        );

        if missing_indexes.is_empty() {
            return Ok(results);
        }

        let resolved = resolver(missing_params).await?;
        if resolved.len() != missing_indexes.len() {
            tracing::event!(
                name: "warden.cache.resolver_length_mismatch",
                tracing::Level::WARN,
                expected = missing_indexes.len(),
                actual = resolved.len(),
                "resolver returned a different number of values than it was given"
            );
        }

        let ttl = self.effective_ttl(options.ttl);
        let mut batch = Batch::new();
        let mut written = Vec::new();

        for (index, value) in missing_indexes.into_iter().zip(resolved) {
            let Some(value) = value else { continue };
            let key = keys[index].clone();

            batch = batch.set(key.clone(), codec::encode(&value)?, ttl);
            written.push(key);
            results[index] = Some(value);
        }

        if !written.is_empty() {
            let batch = options
                .tags
                .iter()
                .fold(batch, |batch, tag| batch.sadd(self.keys.tag(tag), written.clone()));
            self.store.exec(batch).await.map_err(Error::from)?;
        }

        Ok(results)
    }
}

impl<S> Clone for CacheCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

impl<S> std::fmt::Debug for CacheCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("keys", &self.keys)
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use warden_store::MemoryStore;

    use super::*;

    fn cache(default_ttl: Duration) -> CacheCoordinator<MemoryStore> {
        CacheCoordinator::new(Arc::new(MemoryStore::new()), KeySpace::default(), default_ttl)
    }

    #[test]
    fn effective_ttl_falls_back_to_default() {
        let cache = cache(Duration::from_secs(3600));

        assert_eq!(cache.effective_ttl(None), Some(Duration::from_secs(3600)));
        assert_eq!(cache.effective_ttl(Some(Duration::from_secs(5))), Some(Duration::from_secs(5)));
        assert_eq!(cache.effective_ttl(Some(Duration::ZERO)), None);
    }

    #[test]
    fn zero_default_means_no_expiry() {
        assert_eq!(cache(Duration::ZERO).effective_ttl(None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_maps_sentinels() {
        let cache = cache(Duration::from_secs(3600));
        cache.set("forever", &1, Some(Duration::ZERO)).await.unwrap();
        cache.set("brief", &1, Some(Duration::from_secs(90))).await.unwrap();

        assert_eq!(cache.remaining_time("absent").await.unwrap(), RemainingTime::Miss);
        assert_eq!(cache.remaining_time("forever").await.unwrap(), RemainingTime::Infinite);
        assert_eq!(
            cache.remaining_time("brief").await.unwrap(),
            RemainingTime::Remaining(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn empty_inputs_make_no_store_calls() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheCoordinator::new(Arc::clone(&store), KeySpace::default(), Duration::from_secs(60));

        assert_eq!(cache.delete::<&str>(&[]).await.unwrap(), 0);
        cache.assign_tags::<&str, &str>(&[], &["users"]).await.unwrap();
        cache.assign_tags::<&str, &str>(&["user:1"], &[]).await.unwrap();
        assert_eq!(cache.delete_by_tags::<&str>(&[]).await.unwrap(), 0);

        assert!(store.operations().is_empty());
    }
}
