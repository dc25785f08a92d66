// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache, lock and store operations.

use std::fmt::{Display, Formatter};

use ohno::ErrorExt;
use recoverable::{Recovery, RecoveryInfo};

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The shared store failed and retries, if any, were exhausted.
    Store,
    /// The lock could not be acquired within its wait budget and no backup entry was available.
    LockTimeout,
    /// The caller-supplied deadline passed while waiting for the lock or for another computation.
    DeadlineExceeded,
    /// The wrapped compute function failed. Its error is the source of this error.
    Compute,
    /// A value could not be serialized.
    Serialization,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Store => "shared store operation failed",
            Self::LockTimeout => "timed out while waiting for lock",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Compute => "compute function failed",
            Self::Serialization => "serialization failed",
        };

        f.write_str(text)
    }
}

/// An error from a cache or lock operation.
///
/// Use [`Error::kind`] to branch on the failure category. The underlying cause, such as a
/// [`StoreError`] or the compute function's own error, is available through
/// [`std::error::Error::source()`].
///
/// # Example
///
/// ```
/// use thundercache::{Error, ErrorKind};
///
/// let error = Error::lock_timeout("LOCK_FOR:SRC:users_42");
/// assert_eq!(error.kind(), ErrorKind::LockTimeout);
/// ```
#[ohno::error]
#[display("{kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Creates a [`ErrorKind::LockTimeout`] error for the given lock key.
    pub fn lock_timeout(lock_key: &str) -> Self {
        Self::caused_by(ErrorKind::LockTimeout, format!("lock '{lock_key}' was not acquired in time"))
    }

    pub(crate) fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded)
    }

    /// The deadline passed while a store operation was still failing; `last` is its last error.
    pub(crate) fn deadline_exceeded_after(last: StoreError) -> Self {
        Self::caused_by(ErrorKind::DeadlineExceeded, last)
    }

    pub(crate) fn compute(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Compute, cause)
    }

    pub(crate) fn serialization(cause: serde_json::Error) -> Self {
        Self::caused_by(ErrorKind::Serialization, cause)
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::caused_by(ErrorKind::Store, error)
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        match self.kind {
            ErrorKind::Store => self.find_source::<StoreError>().map_or_else(RecoveryInfo::unknown, Recovery::recovery),
            ErrorKind::LockTimeout => RecoveryInfo::retry(),
            ErrorKind::DeadlineExceeded | ErrorKind::Serialization => RecoveryInfo::never(),
            ErrorKind::Compute => RecoveryInfo::unknown(),
        }
    }
}

/// A specialized [`Result`] type for cache and lock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The category of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StoreErrorKind {
    /// The connection to the store failed or was dropped.
    Connection,
    /// The store did not answer in time.
    Timeout,
    /// The store node coordinating writes is unreachable or not yet known.
    CoordinatorUnavailable,
    /// Any other failure. Not retried.
    Other,
}

impl Display for StoreErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connection => "store connection failed",
            Self::Timeout => "store operation timed out",
            Self::CoordinatorUnavailable => "store coordinator unavailable",
            Self::Other => "store operation failed",
        };

        f.write_str(text)
    }
}

/// An error reported by a [`SharedStore`][crate::SharedStore] implementation.
///
/// The kind decides whether [`RetryPolicy`][crate::RetryPolicy] retries the operation:
/// connection failures and timeouts are retried, an unavailable coordinator is retried,
/// and everything else propagates immediately.
///
/// # Example
///
/// ```
/// use recoverable::{Recovery, RecoveryKind};
/// use thundercache::{StoreError, StoreErrorKind};
///
/// let error = StoreError::from_cause(StoreErrorKind::Timeout, "read timed out");
/// assert_eq!(error.recovery().kind(), RecoveryKind::Retry);
/// ```
#[ohno::error]
#[display("{kind}")]
pub struct StoreError {
    kind: StoreErrorKind,
}

impl StoreError {
    /// Creates a store error of the given kind from any underlying cause.
    ///
    /// This is the public API for store implementations in other crates.
    pub fn from_cause(kind: StoreErrorKind, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(kind, cause)
    }

    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns `true` if the error is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, StoreErrorKind::Other)
    }
}

impl Recovery for StoreError {
    fn recovery(&self) -> RecoveryInfo {
        match self.kind {
            StoreErrorKind::Connection | StoreErrorKind::Timeout => RecoveryInfo::retry(),
            StoreErrorKind::CoordinatorUnavailable => RecoveryInfo::unavailable(),
            StoreErrorKind::Other => RecoveryInfo::never(),
        }
    }
}
