// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tick::Clock;

use crate::rnd::Rnd;
use crate::{LocalCacheConfig, StaleWindow};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);
const DEFAULT_SWEEP_PROBABILITY: f64 = 0.05;

/// A single sweep stops after this many removals.
const MAX_SWEEP_REMOVALS: usize = 20;

type Slot<V> = Arc<tokio::sync::Mutex<Option<LocalEntry<V>>>>;

struct LocalEntry<V> {
    value: V,
    computed_at: Instant,
    fresh_for: Duration,
}

/// An in-process cache of computed values keyed by call fingerprint.
///
/// A value is recomputed once its age exceeds a [`StaleWindow`]-jittered `max_age`, so
/// values cached together do not all expire together. Concurrent callers of the same
/// fingerprint are serialized, so they compute at most once.
///
/// There is no explicit invalidation. Instead, a small share of calls (5% by default) runs
/// an eviction sweep that samples random entries and removes stale ones. It stops at the
/// first fresh entry or after 20 removals, which bounds growth without scanning the whole
/// map on every call.
///
/// The cache never talks to a shared store; use [`StampedeCache`][crate::StampedeCache] to
/// coordinate across processes.
///
/// # Example
///
/// ```
/// # async fn example() {
/// use std::time::Duration;
///
/// use thundercache::LocalCache;
/// use tick::Clock;
///
/// let cache = LocalCache::<String>::builder("greetings", Clock::new_tokio())
///     .max_age(Duration::from_secs(30))
///     .build();
///
/// let greeting = cache
///     .call("en", || async { Ok::<_, std::io::Error>("hello".to_string()) })
///     .await
///     .unwrap();
/// assert_eq!(greeting, "hello");
/// # }
/// ```
pub struct LocalCache<V> {
    namespace: String,
    max_age: Duration,
    sweep_probability: f64,
    clock: Clock,
    window: StaleWindow,
    rnd: Rnd,
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V> Debug for LocalCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("namespace", &self.namespace)
            .field("max_age", &self.max_age)
            .field("sweep_probability", &self.sweep_probability)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<V> LocalCache<V> {
    /// Creates a builder for a cache in `namespace`.
    #[must_use]
    pub fn builder(namespace: impl Into<String>, clock: Clock) -> LocalCacheBuilder<V> {
        LocalCacheBuilder {
            namespace: namespace.into(),
            clock,
            max_age: DEFAULT_MAX_AGE,
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            rnd: Rnd::default(),
            _value: PhantomData,
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

    /// Returns the number of fingerprints currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if no fingerprint is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Returns the cached value for `fingerprint`, computing it if absent or stale.
    ///
    /// # Errors
    ///
    /// Returns the error of `compute` unchanged. A failed computation leaves any previous
    /// value in place.
    pub async fn call<F, Fut, E>(&self, fingerprint: &str, compute: F) -> Result<V, E>
    where
        V: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if self.rnd.next_f64() < self.sweep_probability {
            self.sweep();
        }

        let slot = self.slot(fingerprint);
        let mut entry = slot.lock().await;

        if let Some(existing) = (*entry).as_ref()
            && !self.is_stale(existing, self.clock.instant())
        {
            return Ok(existing.value.clone());
        }

        tracing::event!(
            name: "thundercache.local.compute",
            tracing::Level::DEBUG,
            cache.namespace = %self.namespace,
            cache.refresh = entry.is_some(),
        );

        let value = compute().await?;
        *entry = Some(LocalEntry {
            value: value.clone(),
            computed_at: self.clock.instant(),
            fresh_for: self.max_age,
        });

        Ok(value)
    }

    fn slot(&self, fingerprint: &str) -> Slot<V> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(fingerprint) {
            return Arc::clone(slot);
        }

        let slot: Slot<V> = Arc::default();
        slots.insert(fingerprint.to_string(), Arc::clone(&slot));
        slot
    }

    fn is_stale(&self, entry: &LocalEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.computed_at) > self.window.jitter(entry.fresh_for)
    }

    /// Removes randomly sampled stale entries and returns how many were removed.
    ///
    /// Sampling stops at the first entry that is fresh or in use by a caller, after
    /// 20 removals, or when the map is empty. Slots left empty by a failed computation
    /// count as stale.
    fn sweep(&self) -> usize {
        let now = self.clock.instant();
        let mut slots = self.slots.lock();
        let mut removed = 0;

        while removed < MAX_SWEEP_REMOVALS && !slots.is_empty() {
            let victim = {
                let Some((fingerprint, slot)) = slots.iter().nth(self.rnd.index(slots.len())) else {
                    break;
                };

                // someone besides the map holds the slot, so a caller is using it
                if Arc::strong_count(slot) > 1 {
                    break;
                }

                let evict = slot
                    .try_lock()
                    .is_ok_and(|guard| (*guard).as_ref().is_none_or(|entry| self.is_stale(entry, now)));
                if !evict {
                    break;
                }

                fingerprint.clone()
            };

            slots.remove(&victim);
            removed += 1;
        }

        if removed > 0 {
            tracing::event!(
                name: "thundercache.local.sweep",
                tracing::Level::DEBUG,
                cache.namespace = %self.namespace,
                cache.evicted = removed,
                cache.remaining = slots.len(),
            );
        }

        removed
    }

    #[cfg(test)]
    fn contains(&self, fingerprint: &str) -> bool {
        self.slots.lock().contains_key(fingerprint)
    }
}

/// Builder for [`LocalCache`].
///
/// Created by [`LocalCache::builder`].
pub struct LocalCacheBuilder<V> {
    namespace: String,
    clock: Clock,
    max_age: Duration,
    sweep_probability: f64,
    rnd: Rnd,
    _value: PhantomData<fn() -> V>,
}

impl<V> Debug for LocalCacheBuilder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheBuilder")
            .field("namespace", &self.namespace)
            .field("max_age", &self.max_age)
            .field("sweep_probability", &self.sweep_probability)
            .finish_non_exhaustive()
    }
}

impl<V> LocalCacheBuilder<V> {
    /// Sets the nominal freshness of computed values. Defaults to 60 seconds.
    #[must_use]
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Sets the share of calls, between 0 and 1, that run an eviction sweep. Defaults to 0.05.
    #[must_use]
    pub fn sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Applies every setting from `config`.
    #[must_use]
    pub fn config(self, config: &LocalCacheConfig) -> Self {
        self.max_age(config.max_age())
            .sweep_probability(config.sweep_probability)
    }

    #[cfg(test)]
    fn rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// Builds the cache.
    #[must_use]
    pub fn build(self) -> LocalCache<V> {
        LocalCache {
            namespace: self.namespace,
            max_age: self.max_age,
            sweep_probability: self.sweep_probability,
            clock: self.clock,
            window: StaleWindow::new(),
            rnd: self.rnd,
            slots: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tick::ClockControl;

    use super::*;

    fn counting(counter: &Arc<AtomicU32>, value: u32) -> impl Future<Output = Result<u32, io::Error>> {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    fn cache(control: &ClockControl) -> LocalCache<u32> {
        LocalCache::builder("test", control.to_clock()).sweep_probability(0.0).build()
    }

    #[tokio::test]
    async fn fresh_value_is_served_from_cache() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        assert_eq!(cache.call("a", || counting(&computed, 1)).await.unwrap(), 1);
        assert_eq!(cache.call("a", || counting(&computed, 2)).await.unwrap(), 1);

        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_recomputes_before_lower_bound() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));
        let lower = StaleWindow::lower_bound(cache.max_age());

        for fingerprint in 0..50 {
            cache.call(&fingerprint.to_string(), || counting(&computed, 1)).await.unwrap();
        }

        control.advance(lower);
        for fingerprint in 0..50 {
            cache.call(&fingerprint.to_string(), || counting(&computed, 2)).await.unwrap();
        }

        assert_eq!(computed.load(Ordering::SeqCst), 50);
    }

    #[tokio::test]
    async fn always_recomputes_after_upper_bound() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));
        let upper = StaleWindow::upper_bound(cache.max_age());

        for fingerprint in 0..50 {
            cache.call(&fingerprint.to_string(), || counting(&computed, 1)).await.unwrap();
        }

        control.advance(upper + Duration::from_millis(1));
        for fingerprint in 0..50 {
            let value = cache.call(&fingerprint.to_string(), || counting(&computed, 2)).await.unwrap();
            assert_eq!(value, 2);
        }

        assert_eq!(computed.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn concurrent_callers_compute_once() {
        let control = ClockControl::new().auto_advance_timers(true);
        let clock = control.to_clock();
        let cache = LocalCache::<u32>::builder("test", clock.clone()).sweep_probability(0.0).build();
        let computed = Arc::new(AtomicU32::new(0));

        let slow = || {
            let computed = Arc::clone(&computed);
            let clock = clock.clone();
            async move {
                computed.fetch_add(1, Ordering::SeqCst);
                clock.delay(Duration::from_secs(1)).await;
                Ok::<_, io::Error>(7)
            }
        };

        let (first, second) = futures::join!(cache.call("k", slow), cache.call("k", slow));

        assert_eq!(first.unwrap(), 7);
        assert_eq!(second.unwrap(), 7);
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_compute_is_returned_and_not_cached() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        let error = cache
            .call("k", || async { Err::<u32, _>(io::Error::other("backend down")) })
            .await
            .expect_err("compute failed");
        assert_eq!(error.to_string(), "backend down");

        assert_eq!(cache.call("k", || counting(&computed, 3)).await.unwrap(), 3);
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_is_retried_on_next_call() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        cache.call("k", || counting(&computed, 1)).await.unwrap();
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));

        cache
            .call("k", || async { Err::<u32, _>(io::Error::other("flaky")) })
            .await
            .expect_err("refresh failed");

        // still stale, so the next call recomputes rather than serving the old value
        assert_eq!(cache.call("k", || counting(&computed, 2)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_at_most_twenty() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        for fingerprint in 0..50 {
            cache.call(&fingerprint.to_string(), || counting(&computed, 1)).await.unwrap();
        }
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));

        assert_eq!(cache.sweep(), 20);
        assert_eq!(cache.len(), 30);
        assert_eq!(cache.sweep(), 20);
        assert_eq!(cache.sweep(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn sweep_never_removes_fresh_entries() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        for fingerprint in 0..10 {
            cache.call(&format!("old-{fingerprint}"), || counting(&computed, 1)).await.unwrap();
        }
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));
        for fingerprint in 0..10 {
            cache.call(&format!("new-{fingerprint}"), || counting(&computed, 1)).await.unwrap();
        }

        for _ in 0..100 {
            let _ = cache.sweep();
        }

        for fingerprint in 0..10 {
            assert!(cache.contains(&format!("new-{fingerprint}")));
        }
        assert!(cache.len() >= 10);
    }

    #[tokio::test]
    async fn sweep_stops_at_fresh_entry() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        for fingerprint in 0..30 {
            cache.call(&fingerprint.to_string(), || counting(&computed, 1)).await.unwrap();
        }

        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 30);
    }

    #[tokio::test]
    async fn sweep_skips_slots_in_use() {
        let control = ClockControl::new();
        let cache = cache(&control);
        let computed = Arc::new(AtomicU32::new(0));

        cache.call("busy", || counting(&computed, 1)).await.unwrap();
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));

        let held = cache.slot("busy");
        assert_eq!(cache.sweep(), 0);
        drop(held);
        assert_eq!(cache.sweep(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_slots_left_empty() {
        let control = ClockControl::new();
        let cache = cache(&control);

        let _ = cache
            .call("k", || async { Err::<u32, _>(io::Error::other("nope")) })
            .await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn calls_trigger_sweep_by_probability() {
        let control = ClockControl::new();
        let cache = LocalCache::<u32>::builder("test", control.to_clock())
            .sweep_probability(1.0)
            .build();
        let computed = Arc::new(AtomicU32::new(0));

        cache.call("old", || counting(&computed, 1)).await.unwrap();
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));
        cache.call("new", || counting(&computed, 1)).await.unwrap();

        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }

    #[tokio::test]
    async fn never_sweeps_when_draw_is_above_probability() {
        let control = ClockControl::new();
        let cache = LocalCache::<u32>::builder("test", control.to_clock())
            .rnd(Rnd::new_fixed(0.06))
            .build();
        let computed = Arc::new(AtomicU32::new(0));

        cache.call("old", || counting(&computed, 1)).await.unwrap();
        control.advance(StaleWindow::upper_bound(cache.max_age()) + Duration::from_secs(1));
        cache.call("new", || counting(&computed, 1)).await.unwrap();

        assert!(cache.contains("old"));
    }

    #[test]
    fn builder_applies_config() {
        let config = LocalCacheConfig {
            max_age_secs: 5,
            sweep_probability: 2.0,
        };
        let cache = LocalCache::<u32>::builder("cfg", tick::Clock::new_frozen())
            .config(&config)
            .build();

        assert_eq!(cache.max_age(), Duration::from_secs(5));
        assert!((cache.sweep_probability - 1.0).abs() < f64::EPSILON);
        assert_eq!(cache.namespace(), "cfg");
        assert!(format!("{cache:?}").contains("LocalCache"));
    }
}
