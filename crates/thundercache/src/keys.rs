// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key naming shared by every process that talks to the same store.
//!
//! These formats must stay stable: processes running different versions of this crate
//! coordinate through them.

/// Prefix of the value stored under a primary key while its computation is in flight.
///
/// It is not valid JSON, so it can never collide with an encoded [`CacheEntry`][crate::CacheEntry].
pub const PLACEHOLDER: &[u8] = b"__COMPUTING__";

/// Returns the placeholder written by one computation, tagged with its `token`.
///
/// ```
/// assert_eq!(thundercache::keys::placeholder("9f2c"), b"__COMPUTING__:9f2c");
/// ```
#[must_use]
pub fn placeholder(token: &str) -> Vec<u8> {
    [PLACEHOLDER, b":", token.as_bytes()].concat()
}

/// Returns the key of the lock guarding `key`.
///
/// ```
/// assert_eq!(thundercache::keys::lock_key("SRC:users_42"), "LOCK_FOR:SRC:users_42");
/// ```
#[must_use]
pub fn lock_key(key: &str) -> String {
    format!("LOCK_FOR:{key}")
}

/// Returns the primary key for a fingerprint within a namespace.
///
/// ```
/// assert_eq!(thundercache::keys::primary_key("users", "42"), "SRC:users_42");
/// ```
#[must_use]
pub fn primary_key(namespace: &str, fingerprint: &str) -> String {
    format!("SRC:{namespace}_{fingerprint}")
}

/// Returns the backup key derived from a primary key.
///
/// ```
/// assert_eq!(thundercache::keys::backup_key("SRC:users_42"), "BCK_SRC:users_42_BCK");
/// ```
#[must_use]
pub fn backup_key(primary: &str) -> String {
    format!("BCK_{primary}_BCK")
}

/// Returns `true` if `value` is a computing placeholder, tagged or not.
#[must_use]
pub fn is_placeholder(value: &[u8]) -> bool {
    value.starts_with(PLACEHOLDER)
}
