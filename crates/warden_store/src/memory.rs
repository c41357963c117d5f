// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process store implementation.
//!
//! [`MemoryStore`] implements the full [`KeyValueStore`] contract inside the current process.
//! It records all operations and supports failure injection for testing error paths.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{Batch, Command, CompareDelete, KeyValueStore, Result, SCAN_EXHAUSTED, ScanPage, SetOptions, StoreError, TTL_MISSING, TTL_NO_EXPIRY};

/// Recorded store operation with full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A `get` for the given key.
    Get(String),
    /// A `set` for the given key.
    Set {
        /// The key that was written.
        key: String,
        /// Whether the write was conditional.
        only_if_absent: bool,
    },
    /// A `del` for the given keys.
    Del(Vec<String>),
    /// An `exists` for the given keys.
    Exists(Vec<String>),
    /// An `expire` for the given key.
    Expire(String),
    /// A `ttl` for the given key.
    Ttl(String),
    /// An `sadd` for the given set.
    SAdd {
        /// The set key.
        key: String,
        /// The members added.
        members: Vec<String>,
    },
    /// An `srem` for the given set.
    SRem {
        /// The set key.
        key: String,
        /// The members removed.
        members: Vec<String>,
    },
    /// An `smismember` for the given set.
    SMIsMember(String),
    /// An `sscan` page request.
    SScan {
        /// The set key.
        key: String,
        /// The cursor passed in.
        cursor: String,
    },
    /// An `mget` for the given keys.
    MGet(Vec<String>),
    /// A pipelined batch.
    Exec(Batch),
    /// A compare-and-delete for the given key.
    DeleteIfEquals(String),
    /// A health round trip.
    Ping,
}

impl StoreOp {
    /// Returns `true` when the operation touches the given fully qualified key.
    #[must_use]
    pub fn touches(&self, key: &str) -> bool {
        match self {
            Self::Get(k) | Self::Expire(k) | Self::Ttl(k) | Self::SMIsMember(k) | Self::DeleteIfEquals(k) => k == key,
            Self::Set { key: k, .. } | Self::SAdd { key: k, .. } | Self::SRem { key: k, .. } | Self::SScan { key: k, .. } => k == key,
            Self::Del(keys) | Self::Exists(keys) | Self::MGet(keys) => keys.iter().any(|k| k == key),
            Self::Exec(batch) => batch.commands().iter().any(|command| match command {
                Command::Set { key: k, .. } | Command::Expire { key: k, .. } | Command::SAdd { key: k, .. } => k == key,
                Command::Del { keys } => keys.iter().any(|k| k == key),
            }),
            Self::Ping => false,
        }
    }
}

type FailPredicate = Box<dyn Fn(&StoreOp) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Data {
    slots: HashMap<String, Slot>,
}

impl Data {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Slot> {
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }

        self.slots.get_mut(key)
    }

    fn bytes(&mut self, key: &str, now: Instant) -> Result<Option<Vec<u8>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot {
                value: Value::Bytes(bytes), ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set_members(&mut self, key: &str, now: Instant) -> Result<Option<&mut BTreeSet<String>>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Slot {
                value: Value::Set(members), ..
            }) => Ok(Some(members)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) if ttl.is_zero() => return Err(StoreError::command(format!("invalid expire time for '{key}'"))),
            Some(ttl) => Some(now + ttl),
            None => None,
        };

        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Bytes(value),
                expires_at,
            },
        );
        Ok(())
    }

    fn expire(&mut self, key: &str, ttl: Duration, now: Instant) -> bool {
        if ttl.is_zero() {
            return self.delete(key, now);
        }

        match self.live(key, now) {
            Some(slot) => {
                slot.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str, now: Instant) -> bool {
        self.live(key, now).is_some() && self.slots.remove(key).is_some()
    }

    fn sadd(&mut self, key: &str, members: &[String], now: Instant) -> Result<u64> {
        if self.set_members(key, now)?.is_none() {
            self.slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }

        let set = self.set_members(key, now)?.ok_or_else(|| wrong_type(key))?;
        let added = members.iter().filter(|member| set.insert((*member).clone())).count();
        Ok(added as u64)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::command(format!("WRONGTYPE operation against key '{key}' holding the wrong kind of value"))
}

/// A complete in-process [`KeyValueStore`].
///
/// The store keeps plain values and sets in memory and enforces TTLs on access, using the
/// tokio clock so that tests running with a paused clock observe expiry deterministically.
/// Clones share the same data, which lets several coordinators (standing in for several
/// processes) contend on one store.
///
/// All operations are recorded for later verification.
///
/// # Examples
///
/// ```
/// use warden_store::{KeyValueStore, MemoryStore, StoreOp};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), warden_store::StoreError> {
///
/// let store = MemoryStore::new();
/// store.sadd("tags", &["a".to_string()]).await?;
///
/// assert_eq!(
///     store.operations(),
///     vec![StoreOp::SAdd { key: "tags".to_string(), members: vec!["a".to_string()] }]
/// );
/// # Ok(())
/// # }
/// ```
///
/// # Failure Injection
///
/// ```
/// use warden_store::{KeyValueStore, MemoryStore, StoreOp};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
///
/// let store = MemoryStore::new();
/// store.fail_when(|op| matches!(op, StoreOp::Ping));
///
/// assert!(store.ping().await.is_err());
/// assert!(store.get("key").await.is_ok());
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Data>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("data", &self.data)
            .field("operations", &self.operations)
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish()
    }
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a predicate that determines which operations fail.
    ///
    /// Matching operations are still recorded, then fail with [`StoreError::Connection`]
    /// without touching the data.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate, allowing all operations to succeed.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().clone()
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    /// Returns `true` when the key currently exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().live(key, Instant::now()).is_some()
    }

    /// Number of keys that have not expired.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.data.lock().slots.values().filter(|slot| !slot.is_expired(now)).count()
    }

    /// Removes every key.
    pub fn flush(&self) {
        self.data.lock().slots.clear();
    }

    fn record(&self, op: StoreOp) -> Result<()> {
        let fail = self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op));
        self.operations.lock().push(op);

        if fail {
            return Err(StoreError::connection("injected failure"));
        }

        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.record(StoreOp::Get(key.to_string()))?;
        self.data.lock().bytes(key, Instant::now())
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> Result<bool> {
        self.record(StoreOp::Set {
            key: key.to_string(),
            only_if_absent: options.only_if_absent,
        })?;

        let now = Instant::now();
        let mut data = self.data.lock();

        if options.only_if_absent && data.live(key, now).is_some() {
            return Ok(false);
        }

        data.write(key, value, options.ttl, now)?;
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        self.record(StoreOp::Del(keys.to_vec()))?;

        let now = Instant::now();
        let mut data = self.data.lock();
        Ok(keys.iter().filter(|key| data.delete(key, now)).count() as u64)
    }

    async fn exists(&self, keys: &[String]) -> Result<u64> {
        self.record(StoreOp::Exists(keys.to_vec()))?;

        let now = Instant::now();
        let mut data = self.data.lock();
        Ok(keys.iter().filter(|key| data.live(key, now).is_some()).count() as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.record(StoreOp::Expire(key.to_string()))?;
        Ok(self.data.lock().expire(key, ttl, Instant::now()))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.record(StoreOp::Ttl(key.to_string()))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        Ok(match data.live(key, now) {
            None => TTL_MISSING,
            Some(Slot { expires_at: None, .. }) => TTL_NO_EXPIRY,
            Some(Slot {
                expires_at: Some(at), ..
            }) => {
                // rounded to the nearest second
                let remaining_ms = at.saturating_duration_since(now).as_millis();
                i64::try_from(remaining_ms.saturating_add(500) / 1000).unwrap_or(i64::MAX)
            }
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        self.record(StoreOp::SAdd {
            key: key.to_string(),
            members: members.to_vec(),
        })?;
        self.data.lock().sadd(key, members, Instant::now())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        self.record(StoreOp::SRem {
            key: key.to_string(),
            members: members.to_vec(),
        })?;

        let now = Instant::now();
        let mut data = self.data.lock();

        let Some(set) = data.set_members(key, now)? else {
            return Ok(0);
        };

        let removed = members.iter().filter(|member| set.remove(member.as_str())).count();
        if set.is_empty() {
            data.slots.remove(key);
        }

        Ok(removed as u64)
    }

    async fn smismember(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        self.record(StoreOp::SMIsMember(key.to_string()))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        Ok(match data.set_members(key, now)? {
            Some(set) => members.iter().map(|member| set.contains(member)).collect(),
            None => vec![false; members.len()],
        })
    }

    async fn sscan(&self, key: &str, cursor: &str, count: usize) -> Result<ScanPage> {
        self.record(StoreOp::SScan {
            key: key.to_string(),
            cursor: cursor.to_string(),
        })?;

        let offset: usize = cursor
            .parse()
            .map_err(|_| StoreError::command(format!("invalid cursor '{cursor}'")))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        let Some(set) = data.set_members(key, now)? else {
            return Ok(ScanPage {
                cursor: SCAN_EXHAUSTED.to_string(),
                members: Vec::new(),
            });
        };

        let members: Vec<String> = set.iter().skip(offset).take(count.max(1)).cloned().collect();
        let next = offset + members.len();
        let cursor = if next >= set.len() {
            SCAN_EXHAUSTED.to_string()
        } else {
            next.to_string()
        };

        Ok(ScanPage { cursor, members })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.record(StoreOp::MGet(keys.to_vec()))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        // MGET reports values of the wrong kind as absent instead of failing
        Ok(keys.iter().map(|key| data.bytes(key, now).ok().flatten()).collect())
    }

    async fn exec(&self, batch: Batch) -> Result<()> {
        self.record(StoreOp::Exec(batch.clone()))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        for command in batch {
            match command {
                Command::Set { key, value, ttl } => data.write(&key, value, ttl, now)?,
                Command::Expire { key, ttl } => {
                    data.expire(&key, ttl, now);
                }
                Command::SAdd { key, members } => {
                    data.sadd(&key, &members, now)?;
                }
                Command::Del { keys } => {
                    for key in keys {
                        data.delete(&key, now);
                    }
                }
            }
        }

        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<CompareDelete> {
        self.record(StoreOp::DeleteIfEquals(key.to_string()))?;

        let now = Instant::now();
        let mut data = self.data.lock();

        match data.bytes(key, now)? {
            None => Ok(CompareDelete::Missing),
            Some(current) if current == expected => {
                data.slots.remove(key);
                Ok(CompareDelete::Deleted)
            }
            Some(_) => Ok(CompareDelete::Mismatch),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.record(StoreOp::Ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_with_clock() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), SetOptions::ttl(Duration::from_secs(2))).await.unwrap();

        assert_eq!(store.ttl("k").await.unwrap(), 2);

        tokio::time::advance(Duration::from_millis(2001)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), TTL_MISSING);
    }

    #[tokio::test]
    async fn ttl_without_expiry_is_sentinel() {
        let store = MemoryStore::new();
        store.set("k", b"v".to_vec(), SetOptions::default()).await.unwrap();

        assert_eq!(store.ttl("k").await.unwrap(), TTL_NO_EXPIRY);
    }

    #[tokio::test]
    async fn conditional_set_respects_existing_key() {
        let store = MemoryStore::new();

        assert!(store.set("lock", b"a".to_vec(), SetOptions::if_absent(Duration::from_secs(5))).await.unwrap());
        assert!(!store.set("lock", b"b".to_vec(), SetOptions::if_absent(Duration::from_secs(5))).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let store = MemoryStore::new();

        let result = store.set("k", b"v".to_vec(), SetOptions::ttl(Duration::ZERO)).await;

        assert!(matches!(result, Err(StoreError::Command(_))));
    }

    #[tokio::test]
    async fn wrong_type_is_a_command_error() {
        let store = MemoryStore::new();
        store.sadd("set", &keys(&["a"])).await.unwrap();

        assert!(matches!(store.get("set").await, Err(StoreError::Command(_))));
        assert_eq!(store.mget(&keys(&["set"])).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn sscan_pages_through_all_members() {
        let store = MemoryStore::new();
        let members: Vec<String> = (0..25).map(|i| format!("m{i:02}")).collect();
        store.sadd("set", &members).await.unwrap();

        let mut cursor = SCAN_EXHAUSTED.to_string();
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = store.sscan("set", &cursor, 10).await.unwrap();
            pages += 1;
            seen.extend(page.members.iter().cloned());
            if page.is_last() {
                break;
            }
            cursor = page.cursor;
        }

        assert_eq!(pages, 3);
        assert_eq!(seen, members);
    }

    #[tokio::test]
    async fn sscan_of_missing_set_is_exhausted() {
        let store = MemoryStore::new();

        let page = store.sscan("missing", SCAN_EXHAUSTED, 100).await.unwrap();

        assert!(page.is_last());
        assert!(page.members.is_empty());
    }

    #[tokio::test]
    async fn srem_drops_empty_set() {
        let store = MemoryStore::new();
        store.sadd("set", &keys(&["a", "b"])).await.unwrap();

        assert_eq!(store.srem("set", &keys(&["a", "b", "c"])).await.unwrap(), 2);
        assert!(!store.contains_key("set"));
    }

    #[tokio::test]
    async fn delete_if_equals_outcomes() {
        let store = MemoryStore::new();
        store.set("k", b"mine".to_vec(), SetOptions::default()).await.unwrap();

        assert_eq!(store.delete_if_equals("k", b"theirs").await.unwrap(), CompareDelete::Mismatch);
        assert!(store.contains_key("k"));
        assert_eq!(store.delete_if_equals("k", b"mine").await.unwrap(), CompareDelete::Deleted);
        assert_eq!(store.delete_if_equals("k", b"mine").await.unwrap(), CompareDelete::Missing);
    }

    #[tokio::test]
    async fn failed_operations_are_recorded_and_leave_data_untouched() {
        let store = MemoryStore::new();
        store.fail_when(|op| matches!(op, StoreOp::Set { .. }));

        let result = store.set("k", b"v".to_vec(), SetOptions::default()).await;

        assert!(result.unwrap_err().is_connection());
        assert!(!store.contains_key("k"));
        assert_eq!(store.operations().len(), 1);

        store.clear_failures();
        store.set("k", b"v".to_vec(), SetOptions::default()).await.unwrap();
        assert!(store.contains_key("k"));
    }

    #[test]
    fn touches_matches_batch_commands() {
        let op = StoreOp::Exec(Batch::new().sadd("tag", keys(&["a"])).del(keys(&["b"])));

        assert!(op.touches("tag"));
        assert!(op.touches("b"));
        assert!(!op.touches("a"));
    }
}
