// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Redis-backed key-value store for the warden coordination layer.
//!
//! [`RedisStore`] implements [`KeyValueStore`] against any Redis-compatible server (Redis,
//! Valkey, `KeyDB`). It holds a [`ConnectionManager`], which reconnects transparently and is
//! cheap to clone, so one store can be shared by every coordinator in a process.
//!
//! # Quick Start
//!
//! ```no_run
//! use warden_redis::RedisStore;
//! use warden_store::{KeyValueStore, SetOptions};
//! # async fn example() -> Result<(), warden_store::StoreError> {
//!
//! let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//! store.set("greeting", b"hello".to_vec(), SetOptions::default()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Classification
//!
//! Failures that mean the server could not be reached (refused or dropped connections, I/O
//! errors, timeouts) map to [`StoreError::Connection`]. Everything else the server reports
//! maps to [`StoreError::Command`].

use std::fmt::Debug;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use warden_store::{Batch, Command, CompareDelete, KeyValueStore, Result, ScanPage, SetOptions, StoreError};

/// Deletes `KEYS[1]` only when it holds `ARGV[1]`.
///
/// Returns `1` when deleted, `0` when the key is absent and `-1` when it holds another value.
const COMPARE_DELETE: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return -1
";

/// A [`KeyValueStore`] backed by a Redis-compatible server.
///
/// Cloning is cheap; clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    compare_delete: Script,
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the server at `url` (for example `redis://127.0.0.1:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Command`] when the URL is malformed and [`StoreError::Connection`]
    /// when the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(to_store_error)?;
        let connection = ConnectionManager::new(client).await.map_err(to_store_error)?;

        tracing::event!(name: "warden.redis.connected", tracing::Level::DEBUG, "connected to key-value store");

        Ok(Self::from_manager(connection))
    }

    /// Wraps an already established connection manager.
    #[must_use]
    pub fn from_manager(connection: ConnectionManager) -> Self {
        Self {
            connection,
            compare_delete: Script::new(COMPARE_DELETE),
        }
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn to_store_error(error: RedisError) -> StoreError {
    if error.is_connection_refusal() || error.is_io_error() || error.is_timeout() || error.is_connection_dropped() {
        StoreError::connection(error)
    } else {
        StoreError::command(error)
    }
}

/// Milliseconds for `PX`/`PEXPIRE`, rounded up: Redis rejects a zero expiry that a
/// sub-millisecond duration would otherwise truncate to.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut connection = self.connection();
        redis::cmd("GET").arg(key).query_async(&mut connection).await.map_err(to_store_error)
    }

    async fn set(&self, key: &str, value: Vec<u8>, options: SetOptions) -> Result<bool> {
        let mut command = redis::cmd("SET");
        command.arg(key).arg(value);

        if options.only_if_absent {
            command.arg("NX");
        }

        if let Some(ttl) = options.ttl {
            command.arg("PX").arg(millis(ttl));
        }

        let mut connection = self.connection();
        let reply: Option<String> = command.query_async(&mut connection).await.map_err(to_store_error)?;

        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection();
        redis::cmd("DEL").arg(keys).query_async(&mut connection).await.map_err(to_store_error)
    }

    async fn exists(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection();
        redis::cmd("EXISTS").arg(keys).query_async(&mut connection).await.map_err(to_store_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut connection = self.connection();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(to_store_error)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut connection = self.connection();
        redis::cmd("TTL").arg(key).query_async(&mut connection).await.map_err(to_store_error)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection();
        redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut connection)
            .await
            .map_err(to_store_error)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64> {
        if members.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection();
        redis::cmd("SREM")
            .arg(key)
            .arg(members)
            .query_async(&mut connection)
            .await
            .map_err(to_store_error)
    }

    async fn smismember(&self, key: &str, members: &[String]) -> Result<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.connection();
        redis::cmd("SMISMEMBER")
            .arg(key)
            .arg(members)
            .query_async(&mut connection)
            .await
            .map_err(to_store_error)
    }

    async fn sscan(&self, key: &str, cursor: &str, count: usize) -> Result<ScanPage> {
        let mut connection = self.connection();
        let (cursor, members): (String, Vec<String>) = redis::cmd("SSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut connection)
            .await
            .map_err(to_store_error)?;

        Ok(ScanPage { cursor, members })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut connection = self.connection();
        redis::cmd("MGET").arg(keys).query_async(&mut connection).await.map_err(to_store_error)
    }

    async fn exec(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let commands = batch.len();
        let mut pipeline = redis::pipe();
        for command in batch {
            match command {
                Command::Set { key, value, ttl } => {
                    let set = pipeline.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        set.arg("PX").arg(millis(ttl));
                    }
                    set.ignore();
                }
                Command::Expire { key, ttl } => {
                    pipeline.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
                }
                Command::SAdd { key, members } => {
                    pipeline.cmd("SADD").arg(key).arg(members).ignore();
                }
                Command::Del { keys } => {
                    pipeline.cmd("DEL").arg(keys).ignore();
                }
            }
        }

        let mut connection = self.connection();
        let _: () = pipeline.query_async(&mut connection).await.map_err(to_store_error)?;

        tracing::event!(name: "warden.redis.batch", tracing::Level::DEBUG, commands, "batch submitted");
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<CompareDelete> {
        let mut connection = self.connection();
        let outcome: i64 = self
            .compare_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await
            .map_err(to_store_error)?;

        Ok(match outcome {
            1 => CompareDelete::Deleted,
            0 => CompareDelete::Missing,
            _ => CompareDelete::Mismatch,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut connection).await.map_err(to_store_error)?;
        Ok(())
    }
}
