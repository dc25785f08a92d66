// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Redis implementation of [`thundercache::SharedStore`].
//!
//! [`RedisStore`] talks to a single Redis server through a reconnecting
//! [`ConnectionManager`]. The conditional primitives run as Lua scripts, so each one is a
//! single atomic step on the server:
//!
//! - set-if-absent stores the value with `SETNX` and then sets its expiry with `EXPIRE`;
//! - delete-if-equals compares the current value with `GET` and deletes it with `DEL`.
//!
//! These are the scripts every process sharing the server must use, so locks taken by
//! one deployment are honored by every other.
//!
//! Redis errors are classified into [`StoreErrorKind`] so that
//! [`RetryPolicy`](thundercache::RetryPolicy) retries connection problems, timeouts and
//! failovers, and gives up right away on everything else.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use thundercache::StampedeCache;
//! use thundercache_redis::RedisStore;
//! use tick::Clock;
//!
//! let store = RedisStore::connect("redis+unix:///var/run/redis/redis.sock").await?;
//! let cache = StampedeCache::builder(store, "profiles", Clock::new_tokio())
//!     .max_age(Duration::from_secs(600))
//!     .build();
//!
//! let name: String = cache
//!     .call("user-7", || async { Ok::<_, std::io::Error>("Ada".to_string()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use thundercache::{SharedStore, StoreError, StoreErrorKind};

/// Sets `KEYS[1]` to `ARGV[1]` with an expiry of `ARGV[2]` seconds unless it exists.
/// Returns 1 when the key was set and 0 otherwise.
pub const SET_IF_ABSENT_SCRIPT: &str = "
local result = redis.call('SETNX', KEYS[1], ARGV[1])
if result == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return result";

/// Deletes `KEYS[1]` when it holds `ARGV[1]`. Returns 1 when the key was deleted and 0 otherwise.
pub const DELETE_IF_EQUALS_SCRIPT: &str = "
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0";

/// A [`SharedStore`] backed by a Redis server.
///
/// Cloning is cheap and clones share the underlying connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    set_if_absent: Script,
    delete_if_equals: Script,
}

impl Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to the server at `url`.
    ///
    /// Any URL accepted by [`redis::Client::open`] works, including `redis+unix://` sockets.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] when the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(classify)?;
        let connection = ConnectionManager::new(client).await.map_err(classify)?;
        Ok(Self::new(connection))
    }

    /// Creates a store over an existing connection.
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            set_if_absent: Script::new(SET_IF_ABSENT_SCRIPT),
            delete_if_equals: Script::new(DELETE_IF_EQUALS_SCRIPT),
        }
    }
}

impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(key).await.map_err(classify)?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        connection
            .set_ex::<_, _, ()>(key, value, expiry_secs(ttl))
            .await
            .map_err(classify)
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let set: i64 = self
            .set_if_absent
            .key(key)
            .arg(value)
            .arg(expiry_secs(ttl))
            .invoke_async(&mut connection)
            .await
            .map_err(classify)?;
        Ok(set == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await
            .map_err(classify)?;
        Ok(deleted == 1)
    }
}

/// Redis expiries are whole seconds. Partial seconds round up and the minimum is one.
fn expiry_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.max(1)
}

/// Maps a Redis error to the store error kind that drives retries.
fn classify(error: RedisError) -> StoreError {
    StoreError::from_cause(kind_of(&error), error)
}

fn kind_of(error: &RedisError) -> StoreErrorKind {
    if error.is_timeout() {
        return StoreErrorKind::Timeout;
    }

    if error.is_connection_dropped() || error.is_connection_refusal() || error.is_io_error() {
        return StoreErrorKind::Connection;
    }

    if matches!(
        error.kind(),
        redis::ErrorKind::MasterDown
            | redis::ErrorKind::ClusterDown
            | redis::ErrorKind::TryAgain
            | redis::ErrorKind::MasterNameNotFoundBySentinel
            | redis::ErrorKind::NoValidReplicasFoundBySentinel
    ) {
        return StoreErrorKind::CoordinatorUnavailable;
    }

    StoreErrorKind::Other
}
