// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use crate::rnd::Rnd;

/// Offsets, in units of `sqrt(nominal)`, that a staleness window may move by.
const OFFSETS: [f64; 14] = [
    -3.5, -3.0, -2.5, -2.0, -1.5, -1.0, -0.5, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5,
];

/// The largest offset in either direction.
const MAX_OFFSET: f64 = 3.5;

/// The shortest window ever returned, in seconds.
const MIN_WINDOW_SECS: f64 = 0.1;

/// Jitters a nominal freshness duration.
///
/// Entries created together with the same nominal lifetime would otherwise all turn stale
/// at the same instant and be recomputed together. The window is
/// `max(0.1s, nominal + offset * sqrt(nominal))`, where `offset` is picked uniformly from
/// the half-integer steps in `[-3.5, 3.5]` excluding zero and all quantities are in seconds.
/// Scaling by the square root keeps the relative spread small for long lifetimes while
/// still spreading short ones.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use thundercache::StaleWindow;
///
/// let window = StaleWindow::new();
/// let nominal = Duration::from_secs(100);
///
/// let jittered = window.jitter(nominal);
/// assert!(jittered >= StaleWindow::lower_bound(nominal));
/// assert!(jittered <= StaleWindow::upper_bound(nominal));
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaleWindow {
    rnd: Rnd,
}

impl StaleWindow {
    /// Creates a window that draws offsets from the process-wide random source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(rnd: Rnd) -> Self {
        Self { rnd }
    }

    /// Returns `nominal` moved by a random offset.
    #[must_use]
    pub fn jitter(&self, nominal: Duration) -> Duration {
        let offset = OFFSETS[self.rnd.index(OFFSETS.len())];
        window_for(nominal, offset)
    }

    /// The shortest window [`jitter`](Self::jitter) can return for `nominal`.
    #[must_use]
    pub fn lower_bound(nominal: Duration) -> Duration {
        window_for(nominal, -MAX_OFFSET)
    }

    /// The longest window [`jitter`](Self::jitter) can return for `nominal`.
    #[must_use]
    pub fn upper_bound(nominal: Duration) -> Duration {
        window_for(nominal, MAX_OFFSET)
    }
}

fn window_for(nominal: Duration, offset: f64) -> Duration {
    let secs = nominal.as_secs_f64();
    let jittered = offset.mul_add(secs.sqrt(), secs).max(MIN_WINDOW_SECS);

    Duration::try_from_secs_f64(jittered).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_below_minimum() {
        let window = StaleWindow::new();
        for nominal in [Duration::ZERO, Duration::from_millis(1), Duration::from_secs(1), Duration::from_secs(4)] {
            for _ in 0..200 {
                assert!(window.jitter(nominal) >= Duration::from_millis(100));
            }
        }
    }

    #[test]
    fn stays_within_offset_range() {
        let window = StaleWindow::new();
        let nominal = Duration::from_secs(120);
        let lower = StaleWindow::lower_bound(nominal);
        let upper = StaleWindow::upper_bound(nominal);

        for _ in 0..1000 {
            let value = window.jitter(nominal);
            assert!(value >= lower && value <= upper, "{value:?} outside [{lower:?}, {upper:?}]");
        }
    }

    #[test]
    fn never_returns_nominal_exactly() {
        let window = StaleWindow::new();
        let nominal = Duration::from_secs(64);
        for _ in 0..500 {
            assert_ne!(window.jitter(nominal), nominal);
        }
    }

    #[test]
    fn mean_is_close_to_nominal() {
        let window = StaleWindow::new();
        let nominal = Duration::from_secs(100);
        let samples = 20_000;

        let total: f64 = (0..samples).map(|_| window.jitter(nominal).as_secs_f64()).sum();
        let mean = total / f64::from(samples);

        // the offsets are symmetric, so the mean converges on the nominal value
        assert!((mean - 100.0).abs() < 2.0, "mean was {mean}");
    }

    #[test]
    fn offsets_are_picked_by_index() {
        let nominal = Duration::from_secs(100);

        let lowest = StaleWindow::with_rnd(Rnd::new_fixed(0.0)).jitter(nominal);
        assert_eq!(lowest, Duration::from_secs(65));

        let highest = StaleWindow::with_rnd(Rnd::new_fixed(0.999)).jitter(nominal);
        assert_eq!(highest, Duration::from_secs(135));

        let just_above_zero = StaleWindow::with_rnd(Rnd::new_fixed(0.5)).jitter(nominal);
        assert_eq!(just_above_zero, Duration::from_secs(105));
    }

    #[test]
    fn bounds_for_small_values_clamp() {
        assert_eq!(StaleWindow::lower_bound(Duration::from_secs(1)), Duration::from_millis(100));
        assert_eq!(StaleWindow::upper_bound(Duration::from_secs(1)), Duration::from_millis(4500));
    }
}
