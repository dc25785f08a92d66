// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::StoreError;

/// The shared key-value store that processes coordinate through.
///
/// Implementations must make [`set_if_absent`](Self::set_if_absent) and
/// [`delete_if_equals`](Self::delete_if_equals) atomic with respect to every other operation
/// on the same key. The lock's mutual exclusion rests entirely on these two primitives.
///
/// Errors should be classified with an appropriate [`StoreErrorKind`][crate::StoreErrorKind]
/// so that [`RetryPolicy`][crate::RetryPolicy] can tell transient failures apart.
///
/// Stores are cloned freely, so clones should share the same underlying connection. A clone
/// may outlive the caller that made it, for example to release a lock in the background.
///
/// # Implementing a Store
///
/// ```
/// use std::collections::HashMap;
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
///
/// use thundercache::{SharedStore, StoreError};
///
/// /// A store without expiry, good enough for a single test.
/// #[derive(Clone, Default)]
/// struct MapStore(Arc<Mutex<HashMap<String, Vec<u8>>>>);
///
/// impl SharedStore for MapStore {
///     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
///         Ok(self.0.lock().unwrap().get(key).cloned())
///     }
///
///     async fn set_with_expiry(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
///         self.0.lock().unwrap().insert(key.to_string(), value.to_vec());
///         Ok(())
///     }
///
///     async fn set_if_absent(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<bool, StoreError> {
///         let mut map = self.0.lock().unwrap();
///         if map.contains_key(key) {
///             return Ok(false);
///         }
///         map.insert(key.to_string(), value.to_vec());
///         Ok(true)
///     }
///
///     async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
///         let mut map = self.0.lock().unwrap();
///         if map.get(key).is_some_and(|v| v.as_slice() == expected) {
///             map.remove(key);
///             return Ok(true);
///         }
///         Ok(false)
///     }
/// }
/// ```
pub trait SharedStore: Clone + Send + Sync + 'static {
    /// Reads the value stored under `key`, if any.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Stores `value` under `key`, replacing any existing value, and expires it after `ttl`.
    fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Stores `value` under `key` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `true` if the value was stored.
    fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
