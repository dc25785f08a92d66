// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Stampede-safe caching of expensive computations over a shared key-value store.
//!
//! This crate protects costly functions from duplicate concurrent execution across
//! processes while tolerating transient failures of the backing store. It is made of
//! a few pieces that build on each other:
//!
//! - [`RetryPolicy`] retries store operations that fail with a transient error, using
//!   randomized exponential backoff.
//! - [`DistributedLock`] is a named mutual-exclusion primitive implemented with two atomic
//!   store primitives: set-if-absent on acquire and delete-if-token-matches on release.
//! - [`StaleWindow`] jitters a nominal freshness duration so entries created together do
//!   not all expire together.
//! - [`LocalCache`] is an in-process cache with jittered staleness and a probabilistic,
//!   bounded eviction sweep.
//! - [`StampedeCache`] is the cross-process cache. On a miss it takes the lock for the key,
//!   publishes a computing placeholder, computes once, and stores both a primary entry and
//!   a long-lived backup entry. When the lock cannot be obtained the backup is served.
//!
//! The store itself is abstracted by [`SharedStore`]. The `thundercache_redis` crate provides
//! a Redis implementation; [`testing::MockStore`] provides an in-memory one for tests.
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "test-util")]
//! # async fn example() -> Result<(), thundercache::Error> {
//! use std::time::Duration;
//!
//! use thundercache::StampedeCache;
//! use thundercache::testing::MockStore;
//! use tick::Clock;
//!
//! let clock = Clock::new_tokio();
//! let store = MockStore::new(clock.clone());
//! let cache = StampedeCache::builder(store, "pricing", clock)
//!     .max_age(Duration::from_secs(60))
//!     .build();
//!
//! let price: u64 = cache
//!     .call("sku-42", || async { Ok::<_, std::io::Error>(1299) })
//!     .await?;
//! assert_eq!(price, 1299);
//! # Ok(())
//! # }
//! ```
//!
//! # Time
//!
//! Every component takes a [`tick::Clock`]. Sleeps, staleness checks and deadlines all read
//! time from it, which allows tests to drive the whole protocol with virtual time.

mod config;
mod entry;
mod error;
mod jitter;
pub mod keys;
mod local;
mod lock;
mod retry;
mod rnd;
mod stampede;
mod store;
#[cfg(any(feature = "test-util", test))]
pub mod testing;

#[doc(inline)]
pub use config::{LocalCacheConfig, RetryConfig, StampedeConfig};
#[doc(inline)]
pub use entry::{CacheEntry, fingerprint};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result, StoreError, StoreErrorKind};
#[doc(inline)]
pub use jitter::StaleWindow;
#[doc(inline)]
pub use local::{LocalCache, LocalCacheBuilder};
#[doc(inline)]
pub use lock::{Acquisition, DistributedLock, LockGuard, LockOptions};
#[doc(inline)]
pub use retry::{RetryPolicy, RetryPolicyBuilder};
#[doc(inline)]
pub use stampede::{StampedeCache, StampedeCacheBuilder};
#[doc(inline)]
pub use store::SharedStore;
