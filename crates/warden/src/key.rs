// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key naming.

use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A cache key that carries the type of the value stored under it.
///
/// The type parameter ties reads and writes of the same key to one value type at compile time.
///
/// # Examples
///
/// ```
/// use warden::CacheKey;
///
/// struct User;
///
/// fn user_key(id: u64) -> CacheKey<User> {
///     CacheKey::new(format!("user:{id}"))
/// }
///
/// assert_eq!(user_key(7).as_str(), "user:7");
/// ```
pub struct CacheKey<T> {
    key: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> CacheKey<T> {
    /// Creates a typed key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            _value: PhantomData,
        }
    }

    /// The logical (unprefixed) key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Consumes the key, returning the logical key.
    #[must_use]
    pub fn into_string(self) -> String {
        self.key
    }
}

impl<T> Clone for CacheKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.key.clone())
    }
}

impl<T> Debug for CacheKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CacheKey").field(&self.key).finish()
    }
}

impl<T> Display for CacheKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl<T> PartialEq for CacheKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for CacheKey<T> {}

impl<T> Hash for CacheKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> AsRef<str> for CacheKey<T> {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// Maps logical names to fully qualified store keys.
///
/// | Kind | With prefix `app` | Without prefix |
/// |---|---|---|
/// | entry `user:1` | `app:user:1` | `user:1` |
/// | tag `users` | `app:tag:users` | `tag:users` |
/// | lock `order:9` | `app:lock:order:9` | `lock:order:9` |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Option<String>,
}

impl KeySpace {
    /// Creates a key space; an empty prefix counts as no prefix.
    #[must_use]
    pub fn new(prefix: Option<impl Into<String>>) -> Self {
        let prefix = prefix.map(Into::into).filter(|prefix| !prefix.is_empty());
        Self { prefix }
    }

    /// The prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Store key of a cache entry.
    #[must_use]
    pub fn entry(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key.to_string(),
        }
    }

    /// Store key of a tag's reverse-index set.
    #[must_use]
    pub fn tag(&self, tag: &str) -> String {
        self.entry(&format!("tag:{tag}"))
    }

    /// Store key of a lock.
    #[must_use]
    pub fn lock(&self, name: &str) -> String {
        self.entry(&format!("lock:{name}"))
    }
}
