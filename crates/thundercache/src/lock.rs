// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::rnd::Rnd;
use crate::{Error, Result, RetryPolicy, SharedStore, keys};

/// The first polling window while waiting for a held lock.
const INITIAL_POLL_WINDOW: Duration = Duration::from_millis(50);

/// The polling window stops doubling here.
const MAX_POLL_WINDOW: Duration = Duration::from_millis(1500);

/// Expiry and waiting behavior of a [`DistributedLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long an acquired lock lives in the store before it expires on its own.
    ///
    /// Must be longer than the protected section takes, otherwise another holder may
    /// acquire the lock while the section still runs.
    pub ttl: Duration,

    /// The waiting budget. Acquisition makes one attempt per whole second of budget plus one.
    /// Zero means a single attempt without waiting.
    pub wait_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// A named mutual-exclusion lock shared by every process using the same store.
///
/// Acquisition stores a fresh random token under the lock key with an atomic set-if-absent,
/// so at most one acquirer can succeed while the key exists. Release deletes the key only
/// while it still holds that token, so a holder whose lock expired can never delete the
/// lock of a later holder. Expiry guarantees that a crashed holder cannot wedge the lock.
///
/// Waiters poll with a randomized, doubling sleep. There is no fairness: a newcomer may win
/// over a caller that has waited longer.
///
/// # Example
///
/// ```
/// # #[cfg(feature = "test-util")]
/// # async fn example() -> thundercache::Result<()> {
/// use thundercache::testing::MockStore;
/// use thundercache::{DistributedLock, RetryPolicy};
/// use tick::Clock;
///
/// let clock = Clock::new_tokio();
/// let lock = DistributedLock::new(MockStore::new(clock.clone()), "nightly-report", RetryPolicy::new(clock));
///
/// let rows = lock.with_lock(|| async { 42 }).await?;
/// assert_eq!(rows, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DistributedLock<S> {
    store: S,
    key: String,
    options: LockOptions,
    retry: RetryPolicy,
    rnd: Rnd,
}

/// The outcome of [`DistributedLock::try_acquire`].
#[derive(Debug)]
#[must_use]
pub enum Acquisition<S: SharedStore> {
    /// The lock is held until the guard is released or its ttl passes.
    Acquired(LockGuard<S>),
    /// The waiting budget ran out while someone else held the lock.
    TimedOut,
}

impl<S: SharedStore> DistributedLock<S> {
    /// Creates a lock guarding `name`. The store key is `LOCK_FOR:<name>`.
    pub fn new(store: S, name: &str, retry: RetryPolicy) -> Self {
        Self {
            store,
            key: keys::lock_key(name),
            options: LockOptions::default(),
            retry,
            rnd: Rnd::default(),
        }
    }

    /// Replaces the expiry and waiting behavior.
    #[must_use]
    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// Returns the store key of this lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the expiry and waiting behavior of this lock.
    #[must_use]
    pub fn options(&self) -> LockOptions {
        self.options
    }

    /// Tries to acquire the lock within the waiting budget.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Store`][crate::ErrorKind::Store] error when the store keeps
    /// failing after retries.
    pub async fn try_acquire(&self) -> Result<Acquisition<S>> {
        self.acquire_before(None).await
    }

    /// Like [`try_acquire`](Self::try_acquire), but gives up once `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::DeadlineExceeded`][crate::ErrorKind::DeadlineExceeded] error when
    /// the deadline passes while waiting, or a store error as in [`try_acquire`](Self::try_acquire).
    pub async fn try_acquire_until(&self, deadline: Instant) -> Result<Acquisition<S>> {
        self.acquire_before(Some(deadline)).await
    }

    /// Acquires the lock, treating an exhausted waiting budget as an error.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::LockTimeout`][crate::ErrorKind::LockTimeout] error when the
    /// waiting budget runs out, or a store error as in [`try_acquire`](Self::try_acquire).
    pub async fn acquire(&self) -> Result<LockGuard<S>> {
        match self.try_acquire().await? {
            Acquisition::Acquired(guard) => Ok(guard),
            Acquisition::TimedOut => Err(Error::lock_timeout(&self.key)),
        }
    }

    /// Runs `section` while holding the lock and releases it afterwards.
    ///
    /// The lock is released on every path out of the section. A failed release is logged
    /// and does not replace the section's output; the lock then expires through its ttl.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`acquire`](Self::acquire). Errors produced by the section are
    /// part of its output.
    pub async fn with_lock<T, F, Fut>(&self, section: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire().await?;
        let output = section().await;

        if let Err(error) = guard.release().await {
            tracing::event!(
                name: "thundercache.lock.release_failed",
                tracing::Level::WARN,
                lock.key = %self.key,
                error = %error,
            );
        }

        Ok(output)
    }

    async fn acquire_before(&self, deadline: Option<Instant>) -> Result<Acquisition<S>> {
        let token = Uuid::new_v4().simple().to_string();
        let clock = self.retry.clock();
        let mut budget = i64::try_from(self.options.wait_timeout.as_secs()).unwrap_or(i64::MAX);
        let mut window = INITIAL_POLL_WINDOW;
        let mut attempts = 0_u32;

        while budget >= 0 {
            attempts += 1;
            if self.try_set(&token, deadline).await? {
                tracing::event!(
                    name: "thundercache.lock.acquired",
                    tracing::Level::DEBUG,
                    lock.key = %self.key,
                    lock.attempts = attempts,
                );

                return Ok(Acquisition::Acquired(LockGuard {
                    store: self.store.clone(),
                    key: self.key.clone(),
                    token: Some(token),
                    retry: self.retry.clone(),
                }));
            }

            budget -= 1;
            if budget >= 0 {
                let mut sleep = window.mul_f64(self.rnd.next_f64());
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(clock.instant());
                    if remaining.is_zero() {
                        return Err(Error::deadline_exceeded());
                    }
                    sleep = sleep.min(remaining);
                }

                clock.delay(sleep).await;
                window = window.saturating_mul(2).min(MAX_POLL_WINDOW);
            }
        }

        tracing::event!(
            name: "thundercache.lock.timeout",
            tracing::Level::WARN,
            lock.key = %self.key,
            lock.attempts = attempts,
        );

        Ok(Acquisition::TimedOut)
    }

    async fn try_set(&self, token: &str, deadline: Option<Instant>) -> Result<bool> {
        let store = &self.store;
        let key = self.key.as_str();
        let ttl = self.options.ttl;

        self.retry
            .execute_before(deadline, move || store.set_if_absent(key, token.as_bytes(), ttl))
            .await
    }
}

/// Proof of holding a [`DistributedLock`].
///
/// Call [`release`](Self::release) when done. A guard dropped without release, for example
/// because the future holding it was cancelled, releases the lock from a task spawned on the
/// current tokio runtime. Outside a runtime it logs a warning and the lock expires through
/// its ttl.
#[derive(Debug)]
pub struct LockGuard<S: SharedStore> {
    store: S,
    key: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl<S: SharedStore> LockGuard<S> {
    /// Returns the store key of the held lock.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the token proving this acquisition.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Releases the lock if it still holds this guard's token.
    ///
    /// Returns `false` when the lock had already expired or been taken over by another
    /// holder, which is expected when the protected section outlived the ttl.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Store`][crate::ErrorKind::Store] error when the store keeps
    /// failing after retries. The guard is consumed either way.
    pub async fn release(self) -> Result<bool> {
        self.release_before(None).await
    }

    /// Like [`release`](Self::release), but stops retrying once `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::DeadlineExceeded`][crate::ErrorKind::DeadlineExceeded] error
    /// when the store is still failing at the deadline, or the errors of [`release`](Self::release).
    pub async fn release_until(self, deadline: Instant) -> Result<bool> {
        self.release_before(Some(deadline)).await
    }

    pub(crate) async fn release_before(mut self, deadline: Option<Instant>) -> Result<bool> {
        let Some(token) = self.token.clone() else {
            return Ok(false);
        };

        // the token stays set until the delete finishes, so a cancelled release still
        // releases from drop
        let released = delete_token(&self.store, &self.key, &token, &self.retry, deadline).await;
        self.token = None;
        released
    }
}

impl<S: SharedStore> Drop for LockGuard<S> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::event!(
                name: "thundercache.lock.dropped",
                tracing::Level::WARN,
                lock.key = %self.key,
            );
            return;
        };

        tracing::event!(
            name: "thundercache.lock.release_detached",
            tracing::Level::DEBUG,
            lock.key = %self.key,
        );

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let retry = self.retry.clone();
        runtime.spawn(async move {
            if let Err(error) = delete_token(&store, &key, &token, &retry, None).await {
                tracing::event!(
                    name: "thundercache.lock.release_failed",
                    tracing::Level::WARN,
                    lock.key = %key,
                    error = %error,
                );
            }
        });
    }
}

/// Deletes the lock key if it still holds `token`.
async fn delete_token<S: SharedStore>(
    store: &S,
    key: &str,
    token: &str,
    retry: &RetryPolicy,
    deadline: Option<Instant>,
) -> Result<bool> {
    let released = retry
        .execute_before(deadline, move || store.delete_if_equals(key, token.as_bytes()))
        .await?;

    if !released {
        tracing::event!(
            name: "thundercache.lock.lost",
            tracing::Level::DEBUG,
            lock.key = key,
        );
    }

    Ok(released)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use futures::future::join_all;
    use tick::ClockControl;

    use super::*;
    use crate::testing::{MockStore, StoreOp};
    use crate::{ErrorKind, StoreErrorKind};

    fn setup() -> (MockStore, RetryPolicy, ClockControl) {
        let control = ClockControl::new().auto_advance_timers(true);
        let clock = control.to_clock();
        (MockStore::new(clock.clone()), RetryPolicy::new(clock), control)
    }

    fn options(ttl: u64, wait: u64) -> LockOptions {
        LockOptions {
            ttl: Duration::from_secs(ttl),
            wait_timeout: Duration::from_secs(wait),
        }
    }

    fn acquire_attempts(store: &MockStore) -> usize {
        store
            .operations()
            .iter()
            .filter(|op| matches!(op, StoreOp::SetIfAbsent { .. }))
            .count()
    }

    #[tokio::test]
    async fn acquire_stores_token_with_ttl() {
        let (store, retry, _control) = setup();
        let lock = DistributedLock::new(store.clone(), "report", retry).with_options(options(21, 5));

        let guard = lock.acquire().await.unwrap();

        assert_eq!(guard.key(), "LOCK_FOR:report");
        let token = guard.token().unwrap().to_string();
        assert_eq!(token.len(), 32);
        assert_eq!(store.peek("LOCK_FOR:report"), Some(token.into_bytes()));
        assert_eq!(store.ttl("LOCK_FOR:report"), Some(Duration::from_secs(21)));

        assert!(guard.release().await.unwrap());
        assert_eq!(store.peek("LOCK_FOR:report"), None);
    }

    #[tokio::test]
    async fn tokens_are_fresh_per_acquisition() {
        let (store, retry, _control) = setup();
        let lock = DistributedLock::new(store, "k", retry);

        let first = lock.acquire().await.unwrap();
        let first_token = first.token().unwrap().to_string();
        first.release().await.unwrap();

        let second = lock.acquire().await.unwrap();
        assert_ne!(second.token().unwrap(), first_token);
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn contended_lock_times_out_after_budget() {
        let (store, retry, _control) = setup();
        store.insert("LOCK_FOR:busy", b"someone-else", Some(Duration::from_secs(600)));
        let lock = DistributedLock::new(store.clone(), "busy", retry).with_options(options(60, 2));

        let outcome = lock.try_acquire().await.unwrap();

        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(acquire_attempts(&store), 3);
    }

    #[tokio::test]
    async fn zero_wait_makes_a_single_attempt() {
        let (store, retry, _control) = setup();
        store.insert("LOCK_FOR:busy", b"someone-else", None);
        let lock = DistributedLock::new(store.clone(), "busy", retry).with_options(options(60, 0));

        let error = lock.acquire().await.expect_err("held elsewhere");

        assert_eq!(error.kind(), ErrorKind::LockTimeout);
        assert_eq!(acquire_attempts(&store), 1);
    }

    #[tokio::test]
    async fn waiter_acquires_after_holder_expires() {
        let (store, retry, _control) = setup();
        store.insert("LOCK_FOR:k", b"crashed-holder", Some(Duration::from_secs(3)));
        let lock = DistributedLock::new(store, "k", retry).with_options(options(60, 30));

        let guard = lock.acquire().await.expect("lock expires while waiting");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn poll_sleeps_double_up_to_cap() {
        let control = ClockControl::new().auto_advance_timers(true);
        let clock = control.to_clock();
        let store = MockStore::new(clock.clone());
        store.insert("LOCK_FOR:busy", b"x", None);
        let lock = DistributedLock::new(store, "busy", RetryPolicy::new(clock.clone()))
            .with_options(options(60, 7))
            .with_rnd(Rnd::new_fixed(0.999_999));
        let stopwatch = clock.stopwatch();

        let outcome = lock.try_acquire().await.unwrap();

        assert!(matches!(outcome, Acquisition::TimedOut));
        // windows: 0.05, 0.1, 0.2, 0.4, 0.8, 1.5, 1.5
        let elapsed = stopwatch.elapsed();
        assert!(elapsed > Duration::from_millis(4540) && elapsed <= Duration::from_millis(4550), "{elapsed:?}");
    }

    #[tokio::test]
    async fn expired_holder_cannot_release_later_holder() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let store = MockStore::new(clock.clone());
        let retry = RetryPolicy::new(clock);
        let lock = DistributedLock::new(store.clone(), "k", retry).with_options(options(1, 0));

        let stale = lock.acquire().await.unwrap();
        control.advance(Duration::from_secs(2));

        let current = lock.acquire().await.unwrap();
        let current_token = current.token().unwrap().as_bytes().to_vec();

        assert!(!stale.release().await.unwrap());
        assert_eq!(store.peek("LOCK_FOR:k"), Some(current_token));

        assert!(current.release().await.unwrap());
        assert_eq!(store.peek("LOCK_FOR:k"), None);
    }

    #[tokio::test]
    async fn holders_are_mutually_exclusive() {
        let (store, retry, control) = setup();
        let clock = control.to_clock();
        let lock = DistributedLock::new(store, "shared", retry).with_options(options(60, 120));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let holders = (0..6).map(|_| {
            let lock = lock.clone();
            let clock = clock.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            let completed = Arc::clone(&completed);
            async move {
                let guard = lock.acquire().await.expect("acquired within budget");
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);

                clock.delay(Duration::from_millis(100)).await;

                inside.fetch_sub(1, Ordering::SeqCst);
                assert!(guard.release().await.unwrap());
                completed.fetch_add(1, Ordering::SeqCst);
            }
        });

        join_all(holders).await;

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn with_lock_releases_after_section() {
        let (store, retry, _control) = setup();
        let lock = DistributedLock::new(store.clone(), "k", retry);

        let result: std::result::Result<u32, &str> = lock
            .with_lock(|| async {
                assert!(store.peek("LOCK_FOR:k").is_some());
                Err("section failed")
            })
            .await
            .unwrap();

        assert_eq!(result, Err("section failed"));
        assert_eq!(store.peek("LOCK_FOR:k"), None);
    }

    #[tokio::test]
    async fn release_retries_transient_failures() {
        let (store, retry, _control) = setup();
        let failures = Arc::new(AtomicU32::new(2));
        let remaining = Arc::clone(&failures);
        store.fail_when(move |op| {
            let is_release = matches!(op, StoreOp::DeleteIfEquals { .. });
            (is_release && remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok())
                .then_some(StoreErrorKind::Connection)
        });
        let lock = DistributedLock::new(store.clone(), "k", retry);

        let guard = lock.acquire().await.unwrap();
        assert!(guard.release().await.unwrap());

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert_eq!(store.peek("LOCK_FOR:k"), None);
    }

    #[tokio::test]
    async fn persistent_store_failure_surfaces_as_store_error() {
        let (store, _retry, control) = setup();
        let retry = RetryPolicy::builder(control.to_clock()).max_attempts(3).build();
        store.fail_when(|_| Some(StoreErrorKind::Connection));
        let lock = DistributedLock::new(store.clone(), "k", retry);

        let error = lock.acquire().await.expect_err("store is down");

        assert_eq!(error.kind(), ErrorKind::Store);
        assert_eq!(acquire_attempts(&store), 3);
    }

    #[tokio::test]
    async fn deadline_interrupts_waiting() {
        let (store, retry, control) = setup();
        store.insert("LOCK_FOR:busy", b"x", None);
        let clock = control.to_clock();
        let lock = DistributedLock::new(store, "busy", retry).with_options(options(60, 3600));

        let deadline = clock.instant() + Duration::from_secs(5);
        let error = lock.try_acquire_until(deadline).await.expect_err("deadline passes");

        assert_eq!(error.kind(), ErrorKind::DeadlineExceeded);
        assert!(clock.instant() >= deadline);
    }

    #[tokio::test]
    async fn deadline_stops_retrying_a_failing_store() {
        let (store, retry, control) = setup();
        store.fail_when(|_| Some(StoreErrorKind::Timeout));
        let clock = control.to_clock();
        let lock = DistributedLock::new(store.clone(), "k", retry);
        let stopwatch = clock.stopwatch();

        let error = lock
            .try_acquire_until(clock.instant() + Duration::from_secs(2))
            .await
            .expect_err("store never answers");

        assert_eq!(error.kind(), ErrorKind::DeadlineExceeded);
        assert!(stopwatch.elapsed() <= Duration::from_secs(2), "{:?}", stopwatch.elapsed());
    }

    #[tokio::test]
    async fn release_until_gives_up_at_deadline() {
        let (store, retry, control) = setup();
        let clock = control.to_clock();
        let lock = DistributedLock::new(store.clone(), "k", retry);
        let guard = lock.acquire().await.unwrap();
        store.fail_when(|op| matches!(op, StoreOp::DeleteIfEquals { .. }).then_some(StoreErrorKind::Connection));

        let error = guard
            .release_until(clock.instant() + Duration::from_secs(1))
            .await
            .expect_err("release keeps failing");

        assert_eq!(error.kind(), ErrorKind::DeadlineExceeded);
        assert!(store.peek("LOCK_FOR:k").is_some());
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let store = MockStore::new(clock.clone());
        let lock = DistributedLock::new(store.clone(), "k", RetryPolicy::new(clock)).with_options(options(60, 0));

        let guard = lock.acquire().await.unwrap();
        drop(guard);

        for _ in 0..10 {
            if store.peek("LOCK_FOR:k").is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.peek("LOCK_FOR:k"), None);
    }

    #[tokio::test]
    async fn dropped_guard_leaves_later_holder_alone() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let store = MockStore::new(clock.clone());
        let lock = DistributedLock::new(store.clone(), "k", RetryPolicy::new(clock)).with_options(options(1, 0));

        let stale = lock.acquire().await.unwrap();
        control.advance(Duration::from_secs(2));
        let current = lock.acquire().await.unwrap();
        let current_token = current.token().unwrap().as_bytes().to_vec();

        drop(stale);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.peek("LOCK_FOR:k"), Some(current_token));
        assert!(current.release().await.unwrap());
    }

    #[test]
    fn dropped_guard_outside_runtime_keeps_lock_until_ttl() {
        let control = ClockControl::new();
        let clock = control.to_clock();
        let store = MockStore::new(clock.clone());
        let lock = DistributedLock::new(store.clone(), "k", RetryPolicy::new(clock)).with_options(options(5, 0));
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

        let guard = runtime.block_on(lock.acquire()).unwrap();
        drop(guard);

        assert!(store.peek("LOCK_FOR:k").is_some());
        control.advance(Duration::from_secs(5));
        assert!(store.peek("LOCK_FOR:k").is_none());
    }

    #[test]
    fn default_options() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(60));
        assert_eq!(options.wait_timeout, Duration::from_secs(10));
    }
}
