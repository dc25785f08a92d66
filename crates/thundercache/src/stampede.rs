// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tick::Clock;
use uuid::Uuid;

use crate::config::{default_lock_ttl, default_lock_wait};
use crate::{
    Acquisition, CacheEntry, DistributedLock, Error, LockGuard, LockOptions, Result, RetryPolicy, SharedStore,
    StaleWindow, StampedeConfig, keys,
};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(120);
const DEFAULT_CRITICAL: Duration = Duration::from_secs(30);
const DEFAULT_BACKUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Primary entries outlive their nominal freshness by this factor, so stale values stay
/// readable while a refresh is in flight.
const PRIMARY_TTL_FACTOR: u32 = 3;

/// A cross-process cache that computes each missing or stale value once.
///
/// Values live in a [`SharedStore`] under `SRC:<namespace>_<fingerprint>`. A call proceeds as
/// follows:
///
/// 1. The primary entry is read without locking. A fresh entry is returned.
/// 2. Otherwise the caller takes the [`DistributedLock`] for the primary key and reads the
///    entry again. If it is still missing, or still the stale entry seen in step 1, the caller
///    writes a computing placeholder that expires after `critical`, releases the lock,
///    computes, and publishes the result under the primary key and a long-lived backup key.
///    Any other entry is returned as-is. While the placeholder is present, the caller polls
///    with jittered sleeps until it is replaced or expires.
/// 3. If the lock cannot be obtained within its waiting budget, the backup entry is served.
///    Without a backup the call fails with [`ErrorKind::LockTimeout`][crate::ErrorKind::LockTimeout].
///
/// Each placeholder carries a random token. A placeholder left by a failed computation is
/// cleared right away, but only while it still holds that token. One left by a crashed
/// process expires after `critical`, after which the next poller takes over. If the future
/// of a call is dropped while it holds the lock, the lock is released in the background.
///
/// Values are stored as JSON [`CacheEntry`] documents, so every process sharing a namespace
/// must use the same value type for it. Entries that fail to decode are treated as missing.
///
/// # Example
///
/// ```
/// # #[cfg(feature = "test-util")]
/// # async fn example() -> thundercache::Result<()> {
/// use std::time::Duration;
///
/// use thundercache::{StampedeCache, fingerprint};
/// use thundercache::testing::MockStore;
/// use tick::Clock;
///
/// let clock = Clock::new_tokio();
/// let cache = StampedeCache::builder(MockStore::new(clock.clone()), "exchange-rates", clock)
///     .max_age(Duration::from_secs(300))
///     .critical(Duration::from_secs(10))
///     .build();
///
/// let key = fingerprint(&("EUR", "USD"))?;
/// let rate: f64 = cache.call(&key, || async { Ok::<_, std::io::Error>(1.08) }).await?;
/// assert_eq!(rate, 1.08);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct StampedeCache<S> {
    store: S,
    namespace: String,
    clock: Clock,
    max_age: Duration,
    critical: Duration,
    lock_options: LockOptions,
    backup_ttl: Duration,
    retry: RetryPolicy,
    window: StaleWindow,
}

enum Lookup<V> {
    Missing,
    Placeholder,
    Entry(CacheEntry<V>),
}

enum Claim<V> {
    Ready(V),
    /// This caller computes; the payload is the placeholder it wrote.
    Compute(Vec<u8>),
}

impl<S: SharedStore> StampedeCache<S> {
    /// Creates a builder for a cache in `namespace` backed by `store`.
    #[must_use]
    pub fn builder(store: S, namespace: impl Into<String>, clock: Clock) -> StampedeCacheBuilder<S> {
        StampedeCacheBuilder {
            store,
            namespace: namespace.into(),
            retry: RetryPolicy::new(clock.clone()),
            clock,
            max_age: DEFAULT_MAX_AGE,
            critical: DEFAULT_CRITICAL,
            lock_ttl: None,
            lock_wait: None,
            backup_ttl: DEFAULT_BACKUP_TTL,
        }
    }

    /// Returns the namespace of this cache.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the nominal freshness of newly computed values.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Returns how long the computing placeholder lives.
    #[must_use]
    pub fn critical(&self) -> Duration {
        self.critical
    }

    /// Returns the options of the per-key lock.
    #[must_use]
    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    /// Returns how long primary entries are kept in the store.
    #[must_use]
    pub fn primary_ttl(&self) -> Duration {
        self.max_age.saturating_mul(PRIMARY_TTL_FACTOR)
    }

    /// Returns how long backup entries are kept in the store.
    #[must_use]
    pub fn backup_ttl(&self) -> Duration {
        self.backup_ttl
    }

    /// Returns the cached value for `fingerprint`, computing it at most once across all
    /// processes when it is missing or stale.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Compute`][crate::ErrorKind::Compute] wraps an error returned by `compute`.
    /// - [`ErrorKind::LockTimeout`][crate::ErrorKind::LockTimeout] when the lock stays busy for
    ///   its whole waiting budget and no backup entry exists.
    /// - [`ErrorKind::Store`][crate::ErrorKind::Store] when the store keeps failing after retries.
    pub async fn call<V, F, Fut, E>(&self, fingerprint: &str, compute: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.call_until(fingerprint, None, compute).await
    }

    /// Like [`call`](Self::call), but stops waiting once `deadline` passes. This covers waiting
    /// for the lock, for another process's computation, and between retries of a failing
    /// store. A computation this call has started always runs to completion. The writes that
    /// follow it get at least one attempt each but are not retried past the deadline.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::DeadlineExceeded`][crate::ErrorKind::DeadlineExceeded] error when
    /// the deadline passes while waiting, or any error of [`call`](Self::call).
    pub async fn call_with_deadline<V, F, Fut, E>(&self, fingerprint: &str, deadline: Instant, compute: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.call_until(fingerprint, Some(deadline), compute).await
    }

    async fn call_until<V, F, Fut, E>(&self, fingerprint: &str, deadline: Option<Instant>, compute: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let primary = keys::primary_key(&self.namespace, fingerprint);

        let observed = match self.lookup::<V>(&primary, deadline).await? {
            Lookup::Entry(entry) if !entry.is_stale(self.clock.system_time(), &self.window) => {
                return Ok(entry.into_value());
            }
            Lookup::Entry(entry) => Some(entry.computed_at()),
            Lookup::Missing | Lookup::Placeholder => None,
        };

        let lock = DistributedLock::new(self.store.clone(), &primary, self.retry.clone()).with_options(self.lock_options);
        let acquisition = match deadline {
            Some(deadline) => lock.try_acquire_until(deadline).await?,
            None => lock.try_acquire().await?,
        };

        let guard = match acquisition {
            Acquisition::Acquired(guard) => guard,
            Acquisition::TimedOut => return self.serve_backup(&primary, lock.key(), deadline).await,
        };

        let claim = self.claim::<V>(&primary, observed, deadline).await;
        self.release(guard, deadline).await;

        match claim? {
            Claim::Ready(value) => Ok(value),
            Claim::Compute(placeholder) => self.compute_and_publish(&primary, &placeholder, deadline, compute).await,
        }
    }

    /// Decides, while holding the lock, whether this caller computes or returns what another
    /// process published.
    async fn claim<V: DeserializeOwned>(&self, primary: &str, observed: Option<SystemTime>, deadline: Option<Instant>) -> Result<Claim<V>> {
        let poll_nominal = Duration::from_secs_f64(self.critical.as_secs_f64().sqrt());

        loop {
            match self.lookup::<V>(primary, deadline).await? {
                Lookup::Missing => return self.write_placeholder(primary, deadline).await,
                Lookup::Entry(entry) if observed == Some(entry.computed_at()) => {
                    return self.write_placeholder(primary, deadline).await;
                }
                Lookup::Entry(entry) => return Ok(Claim::Ready(entry.into_value())),
                Lookup::Placeholder => {
                    let mut sleep = self.window.jitter(poll_nominal);
                    if let Some(deadline) = deadline {
                        let remaining = deadline.saturating_duration_since(self.clock.instant());
                        if remaining.is_zero() {
                            return Err(Error::deadline_exceeded());
                        }
                        sleep = sleep.min(remaining);
                    }

                    tracing::event!(
                        name: "thundercache.placeholder.wait",
                        tracing::Level::DEBUG,
                        cache.key = primary,
                        wait.delay = sleep.as_secs_f32(),
                    );

                    self.clock.delay(sleep).await;
                }
            }
        }
    }

    async fn compute_and_publish<V, F, Fut, E>(&self, primary: &str, placeholder: &[u8], deadline: Option<Instant>, compute: F) -> Result<V>
    where
        V: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        tracing::event!(
            name: "thundercache.compute",
            tracing::Level::DEBUG,
            cache.key = primary,
        );

        match compute().await {
            Ok(value) => {
                self.publish(primary, &value, deadline).await;
                Ok(value)
            }
            Err(error) => {
                self.clear_placeholder(primary, placeholder, deadline).await;
                Err(Error::compute(error))
            }
        }
    }

    /// Reads and decodes `key`. Undecodable entries read as missing.
    async fn lookup<V: DeserializeOwned>(&self, key: &str, deadline: Option<Instant>) -> Result<Lookup<V>> {
        let store = &self.store;
        let Some(bytes) = self.retry.execute_before(deadline, move || store.get(key)).await? else {
            return Ok(Lookup::Missing);
        };

        if keys::is_placeholder(&bytes) {
            return Ok(Lookup::Placeholder);
        }

        match CacheEntry::decode(&bytes) {
            Ok(entry) => Ok(Lookup::Entry(entry)),
            Err(error) => {
                tracing::event!(
                    name: "thundercache.entry.corrupt",
                    tracing::Level::WARN,
                    cache.key = key,
                    error = %error,
                );
                Ok(Lookup::Missing)
            }
        }
    }

    async fn serve_backup<V: DeserializeOwned>(&self, primary: &str, lock_key: &str, deadline: Option<Instant>) -> Result<V> {
        let backup = keys::backup_key(primary);

        match self.lookup::<V>(&backup, deadline).await? {
            Lookup::Entry(entry) => {
                tracing::event!(
                    name: "thundercache.fallback.backup",
                    tracing::Level::WARN,
                    cache.key = primary,
                    entry.age = entry.age(self.clock.system_time()).as_secs_f32(),
                );
                Ok(entry.into_value())
            }
            Lookup::Missing | Lookup::Placeholder => Err(Error::lock_timeout(lock_key)),
        }
    }

    /// Marks `primary` as being computed by this caller.
    async fn write_placeholder<V>(&self, primary: &str, deadline: Option<Instant>) -> Result<Claim<V>> {
        let placeholder = keys::placeholder(&Uuid::new_v4().simple().to_string());
        let store = &self.store;
        let value = placeholder.as_slice();
        let ttl = self.critical;
        self.retry
            .execute_before(deadline, move || store.set_with_expiry(primary, value, ttl))
            .await?;
        Ok(Claim::Compute(placeholder))
    }

    /// Removes this caller's placeholder. A placeholder written by another caller after this
    /// one expired is left alone.
    async fn clear_placeholder(&self, primary: &str, placeholder: &[u8], deadline: Option<Instant>) {
        let store = &self.store;
        let cleared = self
            .retry
            .execute_before(deadline, move || store.delete_if_equals(primary, placeholder))
            .await;

        if let Err(error) = cleared {
            tracing::event!(
                name: "thundercache.placeholder.clear_failed",
                tracing::Level::WARN,
                cache.key = primary,
                error = %error,
            );
        }
    }

    /// Writes the primary and backup entries. Failures are logged; the value stays valid for
    /// this caller either way.
    async fn publish<V: Serialize>(&self, primary: &str, value: &V, deadline: Option<Instant>) {
        let entry = CacheEntry::new(value, self.clock.system_time(), self.max_age);
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                self.report_publish_failure(primary, &error);
                return;
            }
        };

        let backup = keys::backup_key(primary);
        for (key, ttl) in [(primary, self.primary_ttl()), (backup.as_str(), self.backup_ttl)] {
            let store = &self.store;
            let bytes = bytes.as_slice();
            if let Err(error) = self
                .retry
                .execute_before(deadline, move || store.set_with_expiry(key, bytes, ttl))
                .await
            {
                self.report_publish_failure(key, &error);
            }
        }
    }

    fn report_publish_failure(&self, key: &str, error: &dyn std::fmt::Display) {
        tracing::event!(
            name: "thundercache.publish.failed",
            tracing::Level::WARN,
            cache.namespace = %self.namespace,
            cache.key = key,
            error = %error,
        );
    }

    async fn release(&self, guard: LockGuard<S>, deadline: Option<Instant>) {
        let key = guard.key().to_string();
        if let Err(error) = guard.release_before(deadline).await {
            tracing::event!(
                name: "thundercache.lock.release_failed",
                tracing::Level::WARN,
                lock.key = %key,
                error = %error,
            );
        }
    }
}

/// Builder for [`StampedeCache`].
#[derive(Debug)]
pub struct StampedeCacheBuilder<S> {
    store: S,
    namespace: String,
    clock: Clock,
    max_age: Duration,
    critical: Duration,
    lock_ttl: Option<Duration>,
    lock_wait: Option<Duration>,
    backup_ttl: Duration,
    retry: RetryPolicy,
}

impl<S: SharedStore> StampedeCacheBuilder<S> {
    /// Sets the nominal freshness of computed values. Primary entries are kept for three
    /// times this long.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Sets how long a computation may run before waiters treat it as abandoned.
    ///
    /// Unless set explicitly, the lock ttl becomes `critical + 21s` and the lock waiting
    /// budget `critical + 20s`.
    #[must_use]
    pub fn critical(mut self, critical: Duration) -> Self {
        self.critical = critical;
        self
    }

    /// Sets how long an acquired lock lives.
    #[must_use]
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Sets the lock waiting budget. Zero makes a single attempt.
    #[must_use]
    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    /// Sets how long backup entries are kept.
    #[must_use]
    pub fn backup_ttl(mut self, ttl: Duration) -> Self {
        self.backup_ttl = ttl;
        self
    }

    /// Sets the policy used for every store operation.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Applies every setting of `config`, including its retry settings.
    #[must_use]
    pub fn config(mut self, config: &StampedeConfig) -> Self {
        self.max_age = config.max_age();
        self.critical = config.critical();
        self.lock_ttl = config.lock_ttl_secs.map(Duration::from_secs);
        self.lock_wait = config.lock_wait_secs.map(Duration::from_secs);
        self.backup_ttl = config.backup_ttl();
        self.retry = RetryPolicy::builder(self.clock.clone()).config(&config.retry).build();
        self
    }

    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> StampedeCache<S> {
        let lock_options = LockOptions {
            ttl: self.lock_ttl.unwrap_or_else(|| default_lock_ttl(self.critical)),
            wait_timeout: self.lock_wait.unwrap_or_else(|| default_lock_wait(self.critical)),
        };

        StampedeCache {
            store: self.store,
            namespace: self.namespace,
            clock: self.clock,
            max_age: self.max_age,
            critical: self.critical,
            lock_options,
            backup_ttl: self.backup_ttl,
            retry: self.retry,
            window: StaleWindow::new(),
        }
    }
}
