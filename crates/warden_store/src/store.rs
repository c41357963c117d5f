// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The core trait for key-value store backends.
//!
//! [`KeyValueStore`] defines the interface the coordinators consume. Implement the
//! operations against a concrete engine and every coordinator works on top of it.

use std::time::Duration;

use crate::{Batch, Result};

/// Value returned by [`KeyValueStore::ttl`] for a key that exists but never expires.
pub const TTL_NO_EXPIRY: i64 = -1;

/// Value returned by [`KeyValueStore::ttl`] for a key that does not exist.
pub const TTL_MISSING: i64 = -2;

/// Cursor returned by [`KeyValueStore::sscan`] once a scan is complete.
///
/// It is also the cursor that starts a new scan.
pub const SCAN_EXHAUSTED: &str = "0";

/// Options for [`KeyValueStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiry applied atomically with the write. `None` keeps the key forever.
    pub ttl: Option<Duration>,
    /// Only write when the key does not exist yet.
    pub only_if_absent: bool,
}

impl SetOptions {
    /// Unconditional write with the given expiry.
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            only_if_absent: false,
        }
    }

    /// Conditional "set if absent" write with the given expiry.
    #[must_use]
    pub fn if_absent(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            only_if_absent: true,
        }
    }
}

/// One page of a cursor-paginated set scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; [`SCAN_EXHAUSTED`] when the scan is complete.
    pub cursor: String,
    /// Members returned in this page.
    pub members: Vec<String>,
}

impl ScanPage {
    /// Returns `true` when no further pages remain.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.cursor == SCAN_EXHAUSTED
    }
}

/// Outcome of [`KeyValueStore::delete_if_equals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareDelete {
    /// The key held the expected value and was deleted.
    Deleted,
    /// The key did not exist (it was never written or it already expired).
    Missing,
    /// The key exists but holds a different value; it was left untouched.
    Mismatch,
}

/// Trait for key-value store implementations.
///
/// Every method is an asynchronous round trip to the store. Implementations must be
/// shareable across tasks; the coordinators hold them behind an `Arc`.
///
/// Keys passed here are already fully qualified (prefixed). Implementations never rewrite them.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Writes a value. Returns `false` only when [`SetOptions::only_if_absent`] was requested
    /// and the key already existed.
    fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> impl Future<Output = Result<bool>> + Send;

    /// Deletes keys, returning how many existed.
    fn del(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Counts how many of the given keys exist.
    fn exists(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Sets a key's expiry. Returns `false` when the key does not exist.
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Remaining lifetime in whole seconds, or one of [`TTL_NO_EXPIRY`] / [`TTL_MISSING`].
    fn ttl(&self, key: &str) -> impl Future<Output = Result<i64>> + Send;

    /// Adds members to a set, returning how many were new.
    fn sadd(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Removes members from a set, returning how many were present.
    fn srem(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// Membership test for each member, aligned with the input.
    fn smismember(&self, key: &str, members: &[String]) -> impl Future<Output = Result<Vec<bool>>> + Send;

    /// Returns one page of a set's members.
    ///
    /// Start with [`SCAN_EXHAUSTED`] and keep passing the returned cursor until the
    /// returned page [`is_last`][ScanPage::is_last]. `count` is a hint for the page size.
    fn sscan(&self, key: &str, cursor: &str, count: usize) -> impl Future<Output = Result<ScanPage>> + Send;

    /// Reads several values at once, aligned with the input.
    fn mget(&self, keys: &[String]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send;

    /// Submits a batch of commands as one pipelined request.
    ///
    /// Atomicity is best effort: the commands are sent together, but no guarantee is made that
    /// another client cannot observe or interleave with a partially applied batch.
    fn exec(&self, batch: Batch) -> impl Future<Output = Result<()>> + Send;

    /// Deletes `key` only if it currently holds `expected`, as one atomic step.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> impl Future<Output = Result<CompareDelete>> + Send;

    /// Performs a lightweight round trip.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<S> KeyValueStore for std::sync::Arc<S>
where
    S: KeyValueStore,
{
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> impl Future<Output = Result<bool>> + Send {
        (**self).set(key, value, options)
    }

    fn del(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send {
        (**self).del(keys)
    }

    fn exists(&self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send {
        (**self).exists(keys)
    }

    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send {
        (**self).expire(key, ttl)
    }

    fn ttl(&self, key: &str) -> impl Future<Output = Result<i64>> + Send {
        (**self).ttl(key)
    }

    fn sadd(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send {
        (**self).sadd(key, members)
    }

    fn srem(&self, key: &str, members: &[String]) -> impl Future<Output = Result<u64>> + Send {
        (**self).srem(key, members)
    }

    fn smismember(&self, key: &str, members: &[String]) -> impl Future<Output = Result<Vec<bool>>> + Send {
        (**self).smismember(key, members)
    }

    fn sscan(&self, key: &str, cursor: &str, count: usize) -> impl Future<Output = Result<ScanPage>> + Send {
        (**self).sscan(key, cursor, count)
    }

    fn mget(&self, keys: &[String]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        (**self).mget(keys)
    }

    fn exec(&self, batch: Batch) -> impl Future<Output = Result<()>> + Send {
        (**self).exec(batch)
    }

    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> impl Future<Output = Result<CompareDelete>> + Send {
        (**self).delete_if_equals(key, expected)
    }

    fn ping(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).ping()
    }
}
