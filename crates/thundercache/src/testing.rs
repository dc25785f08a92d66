// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory store for testing.
//!
//! This module provides [`MockStore`], a [`SharedStore`] that keeps values in memory,
//! expires them using a [`Clock`], records every operation, and supports failure
//! injection for exercising error paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tick::Clock;

use crate::{SharedStore, StoreError, StoreErrorKind};

/// Recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A get was performed for the given key.
    Get(String),
    /// A value was stored unconditionally.
    SetWithExpiry {
        /// The key that was written.
        key: String,
        /// The value that was written.
        value: Vec<u8>,
        /// The requested expiry.
        ttl: Duration,
    },
    /// A conditional store was attempted.
    SetIfAbsent {
        /// The key that was targeted.
        key: String,
        /// The value that would be written.
        value: Vec<u8>,
        /// The requested expiry.
        ttl: Duration,
    },
    /// A conditional delete was attempted.
    DeleteIfEquals {
        /// The key that was targeted.
        key: String,
        /// The value the key had to hold.
        expected: Vec<u8>,
    },
}

impl StoreOp {
    /// Returns the key this operation targeted.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Get(key)
            | Self::SetWithExpiry { key, .. }
            | Self::SetIfAbsent { key, .. }
            | Self::DeleteIfEquals { key, .. } => key,
        }
    }
}

type FailPredicate = Box<dyn Fn(&StoreOp) -> Option<StoreErrorKind> + Send + Sync>;

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// A configurable in-memory store for testing.
///
/// Values expire according to the [`Clock`] passed at construction, so tests driving a
/// [`tick::ClockControl`] can expire locks and entries by advancing time. Clones share state.
///
/// # Examples
///
/// ```
/// # async fn example() {
/// use std::time::Duration;
///
/// use thundercache::SharedStore;
/// use thundercache::testing::{MockStore, StoreOp};
/// use tick::ClockControl;
///
/// let control = ClockControl::new();
/// let store = MockStore::new(control.to_clock());
///
/// store.set_with_expiry("k", b"v", Duration::from_secs(1)).await.unwrap();
/// assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
///
/// control.advance(Duration::from_secs(2));
/// assert_eq!(store.get("k").await.unwrap(), None);
/// assert_eq!(store.operations().len(), 3);
/// # }
/// ```
///
/// # Failure Injection
///
/// ```
/// # async fn example() {
/// use thundercache::testing::{MockStore, StoreOp};
/// use thundercache::{SharedStore, StoreErrorKind};
/// use tick::Clock;
///
/// let store = MockStore::new(Clock::new_frozen());
///
/// // every get fails with a connection error
/// store.fail_when(|op| matches!(op, StoreOp::Get(_)).then_some(StoreErrorKind::Connection));
/// assert!(store.get("k").await.is_err());
/// # }
/// ```
#[derive(Clone)]
pub struct MockStore {
    clock: Clock,
    data: Arc<Mutex<HashMap<String, Slot>>>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl std::fmt::Debug for MockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("data", &self.data)
            .field("operations", &self.operations)
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl MockStore {
    /// Creates an empty store whose expiry follows `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            data: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            fail_when: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets a predicate that decides which operations fail and with which error kind.
    ///
    /// The predicate returns `Some(kind)` to fail the operation. Failed operations are still
    /// recorded but have no effect on the stored data.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&StoreOp) -> Option<StoreErrorKind> + Send + Sync + 'static,
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

    /// Returns the live value under `key` without recording an operation.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.instant();
        self.data
            .lock()
            .get(key)
            .filter(|slot| is_live(slot, now))
            .map(|slot| slot.value.clone())
    }

    /// Returns the remaining time to live of `key`, without recording an operation.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.instant();
        self.data
            .lock()
            .get(key)
            .filter(|slot| is_live(slot, now))
            .and_then(|slot| slot.expires_at)
            .map(|expires_at| expires_at.saturating_duration_since(now))
    }

    /// Stores a value directly, without recording an operation.
    pub fn insert(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| self.clock.instant().checked_add(ttl));
        self.data.lock().insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        let failure = self.fail_when.lock().as_ref().and_then(|predicate| predicate(&op));
        let description = format!("mock: {op:?} failed");
        self.operations.lock().push(op);

        match failure {
            Some(kind) => Err(StoreError::from_cause(kind, description)),
            None => Ok(()),
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<Instant> {
        self.clock.instant().checked_add(ttl)
    }
}

fn is_live(slot: &Slot, now: Instant) -> bool {
    slot.expires_at.is_none_or(|expires_at| expires_at > now)
}

impl SharedStore for MockStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(StoreOp::Get(key.to_string()))?;
        Ok(self.peek(key))
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.check(StoreOp::SetWithExpiry {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?;

        let expires_at = self.deadline(ttl);
        self.data.lock().insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        self.check(StoreOp::SetIfAbsent {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        })?;

        let now = self.clock.instant();
        let expires_at = self.deadline(ttl);
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|slot| is_live(slot, now)) {
            return Ok(false);
        }

        data.insert(
            key.to_string(),
            Slot {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.check(StoreOp::DeleteIfEquals {
            key: key.to_string(),
            expected: expected.to_vec(),
        })?;

        let now = self.clock.instant();
        let mut data = self.data.lock();
        let matches = data
            .get(key)
            .is_some_and(|slot| is_live(slot, now) && slot.value == expected);
        if matches {
            data.remove(key);
        }

        Ok(matches)
    }
}
