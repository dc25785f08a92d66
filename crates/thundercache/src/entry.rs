// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, StaleWindow};

/// A computed value together with when it was computed and how long it is meant to stay fresh.
///
/// Entries are what [`StampedeCache`][crate::StampedeCache] stores in the shared store, encoded
/// as JSON of the form `{"value": ..., "computed_at_ms": ..., "fresh_for_ms": ...}`.
///
/// # Example
///
/// ```
/// use std::time::{Duration, SystemTime};
///
/// use thundercache::{CacheEntry, StaleWindow};
///
/// let computed_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
/// let entry = CacheEntry::new("report".to_string(), computed_at, Duration::from_secs(60));
///
/// let bytes = entry.encode()?;
/// let decoded = CacheEntry::<String>::decode(&bytes)?;
/// assert_eq!(decoded, entry);
///
/// let window = StaleWindow::new();
/// assert!(!decoded.is_stale(computed_at + Duration::from_secs(1), &window));
/// # Ok::<(), thundercache::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    value: V,
    computed_at_ms: u64,
    fresh_for_ms: u64,
}

impl<V> CacheEntry<V> {
    /// Creates an entry computed at `computed_at` that is nominally fresh for `fresh_for`.
    ///
    /// Times are kept with millisecond precision.
    pub fn new(value: V, computed_at: SystemTime, fresh_for: Duration) -> Self {
        let since_epoch = computed_at.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();

        Self {
            value,
            computed_at_ms: millis(since_epoch),
            fresh_for_ms: millis(fresh_for),
        }
    }

    /// Returns a reference to the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry and returns the cached value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns when the value was computed.
    pub fn computed_at(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.computed_at_ms)
    }

    /// Returns how long the value is nominally fresh for.
    pub fn fresh_for(&self) -> Duration {
        Duration::from_millis(self.fresh_for_ms)
    }

    /// Returns how old the value is at `now`. A `now` before the computation counts as zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.computed_at()).unwrap_or_default()
    }

    /// Returns `true` if the value's age exceeds its jittered freshness window.
    pub fn is_stale(&self, now: SystemTime, window: &StaleWindow) -> bool {
        self.age(now) > window.jitter(self.fresh_for())
    }
}

impl<V: Serialize> CacheEntry<V> {
    /// Encodes the entry for storage.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Serialization`][crate::ErrorKind::Serialization] error if the
    /// value cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(Error::serialization)
    }
}

impl<V: DeserializeOwned> CacheEntry<V> {
    /// Decodes an entry read from storage.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Serialization`][crate::ErrorKind::Serialization] error if the
    /// bytes are not an encoded entry of this value type.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(Error::serialization)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Turns call arguments into a stable key fragment.
///
/// The arguments are serialized as compact JSON and hex-encoded, so the fragment only holds
/// `[0-9a-f]` and is safe inside any store key. The result is deterministic as long as the
/// arguments serialize deterministically, so prefer ordered maps such as `BTreeMap` over
/// `HashMap` for keyed arguments. Any other stable string works as a fingerprint too.
///
/// # Errors
///
/// Returns an [`ErrorKind::Serialization`][crate::ErrorKind::Serialization] error if the
/// arguments cannot be serialized.
///
/// # Example
///
/// ```
/// let fingerprint = thundercache::fingerprint(&("eu", 7))?;
/// assert_eq!(fingerprint, "5b226575222c375d");
/// assert_eq!(hex::decode(&fingerprint).unwrap(), br#"["eu",7]"#);
/// # Ok::<(), thundercache::Error>(())
/// ```
pub fn fingerprint(args: &impl Serialize) -> Result<String, Error> {
    serde_json::to_vec(args).map(hex::encode).map_err(Error::serialization)
}
