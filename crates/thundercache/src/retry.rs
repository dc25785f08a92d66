// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;
use std::time::{Duration, Instant};

use recoverable::{Recovery, RecoveryKind};
use tick::Clock;

use crate::rnd::Rnd;
use crate::{Error, RetryConfig, StoreError};

const DEFAULT_MAX_ATTEMPTS: u32 = 14;
const DEFAULT_MULTIPLIER: f64 = 1.8;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(330);
const DEFAULT_JITTER: (f64, f64) = (0.01, 0.99);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(25);
const DEFAULT_MAX_DELAY_SPREAD: Duration = Duration::from_millis(500);

/// Retries store operations that fail with a transient error.
///
/// An error is transient when its [`Recovery`] classification is [`RecoveryKind::Retry`]
/// or [`RecoveryKind::Unavailable`]. Any other error is returned immediately. When all
/// attempts fail, the last error is returned unchanged.
///
/// Delays grow exponentially. The delay before retry `n` (counting from zero) is
/// `initial_delay * multiplier^n`, plus a random 1% to 99% of that value. It is capped at
/// `max_delay` plus a random spread of up to half a second, drawn once per
/// [`execute`](Self::execute) call.
///
/// Only idempotent or self-correcting operations should be retried. Every operation this
/// crate issues against the store is one of those.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use thundercache::RetryPolicy;
/// use tick::Clock;
///
/// let policy = RetryPolicy::builder(Clock::new_frozen())
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(50))
///     .build();
/// assert_eq!(policy.max_attempts(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    clock: Clock,
    max_attempts: u32,
    multiplier: f64,
    initial_delay: Duration,
    jitter: (f64, f64),
    max_delay: Duration,
    max_delay_spread: Duration,
    rnd: Rnd,
}

impl RetryPolicy {
    /// Creates a policy with default parameters: 14 attempts, a 0.33 second initial delay
    /// growing by 1.8 per attempt, and delays capped near 25 seconds.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self::builder(clock).build()
    }

    /// Creates a builder for a custom policy.
    #[must_use]
    pub fn builder(clock: Clock) -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self {
                clock,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                multiplier: DEFAULT_MULTIPLIER,
                initial_delay: DEFAULT_INITIAL_DELAY,
                jitter: DEFAULT_JITTER,
                max_delay: DEFAULT_MAX_DELAY,
                max_delay_spread: DEFAULT_MAX_DELAY_SPREAD,
                rnd: Rnd::default(),
            },
        }
    }

    /// The total number of attempts, including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The clock used for delays between attempts.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error once all attempts are used.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recovery + Display,
    {
        self.run(None, operation).await.map_err(|stopped| stopped.error)
    }

    /// Like [`execute`](Self::execute), but stops retrying a store operation once `deadline` passes.
    ///
    /// Delays between attempts are shortened so that no sleep runs past the deadline.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::DeadlineExceeded`][crate::ErrorKind::DeadlineExceeded] error,
    /// caused by the last store error, when the deadline passes before the operation succeeds.
    /// Otherwise returns the errors of [`execute`](Self::execute) as
    /// [`ErrorKind::Store`][crate::ErrorKind::Store] errors.
    pub async fn execute_until<T, F, Fut>(&self, deadline: Instant, operation: F) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.execute_before(Some(deadline), operation).await
    }

    pub(crate) async fn execute_before<T, F, Fut>(&self, deadline: Option<Instant>, operation: F) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run(deadline, operation).await.map_err(|stopped| {
            if stopped.deadline_exceeded {
                Error::deadline_exceeded_after(stopped.error)
            } else {
                stopped.error.into()
            }
        })
    }

    async fn run<T, E, F, Fut>(&self, deadline: Option<Instant>, mut operation: F) -> Result<T, Stopped<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recovery + Display,
    {
        let cap = self.draw_cap();
        let mut attempt = 0_u32;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_transient(&error) {
                return Err(Stopped::failed(error));
            }

            let is_last = attempt.saturating_add(1) >= self.max_attempts;
            let mut delay = if is_last { Duration::ZERO } else { self.delay_for(attempt, cap) };

            if let Some(deadline) = deadline.filter(|_| !is_last) {
                let remaining = deadline.saturating_duration_since(self.clock.instant());
                if remaining.is_zero() {
                    tracing::event!(
                        name: "thundercache.retry.deadline",
                        tracing::Level::WARN,
                        attempt.index = attempt,
                        error = %error,
                    );
                    return Err(Stopped {
                        error,
                        deadline_exceeded: true,
                    });
                }
                delay = delay.min(remaining);
            }

            tracing::event!(
                name: "thundercache.retry",
                tracing::Level::WARN,
                attempt.index = attempt,
                attempt.is_last = is_last,
                retry.delay = delay.as_secs_f32(),
                error = %error,
            );

            if is_last {
                return Err(Stopped::failed(error));
            }

            self.clock.delay(delay).await;
            attempt += 1;
        }
    }

    fn draw_cap(&self) -> Duration {
        self.max_delay
            .saturating_add(self.max_delay_spread.mul_f64(self.rnd.next_f64()))
    }

    fn delay_for(&self, attempt: u32, cap: Duration) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let (low, high) = self.jitter;
        let jittered = base * (1.0 + self.rnd.uniform(low, high));

        secs_to_duration_saturating(jittered).min(cap)
    }
}

/// Why [`RetryPolicy::run`] gave up.
struct Stopped<E> {
    error: E,
    deadline_exceeded: bool,
}

impl<E> Stopped<E> {
    fn failed(error: E) -> Self {
        Self {
            error,
            deadline_exceeded: false,
        }
    }
}

fn is_transient(error: &impl Recovery) -> bool {
    match error.recovery().kind() {
        RecoveryKind::Retry | RecoveryKind::Unavailable => true,
        RecoveryKind::Never | RecoveryKind::Unknown | _ => false,
    }
}

fn secs_to_duration_saturating(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Builder for [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Sets the total number of attempts, including the first. Values below one are treated as one.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the factor the delay grows by after each attempt.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Sets the delay before the first retry, before jitter.
    #[must_use]
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.policy.initial_delay = initial_delay;
        self
    }

    /// Sets the range, as fractions of the computed delay, from which the added jitter is drawn.
    #[must_use]
    pub fn jitter(mut self, low: f64, high: f64) -> Self {
        self.policy.jitter = (low.min(high), low.max(high));
        self
    }

    /// Sets the cap on a single delay and the random spread added to the cap.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration, spread: Duration) -> Self {
        self.policy.max_delay = max_delay;
        self.policy.max_delay_spread = spread;
        self
    }

    /// Applies every setting of `config`.
    #[must_use]
    pub fn config(self, config: &RetryConfig) -> Self {
        self.max_attempts(config.max_attempts)
            .multiplier(config.multiplier)
            .initial_delay(Duration::from_millis(config.initial_delay_ms))
            .jitter(config.jitter_min, config.jitter_max)
            .max_delay(
                Duration::from_millis(config.max_delay_ms),
                Duration::from_millis(config.max_delay_spread_ms),
            )
    }

    #[cfg(test)]
    pub(crate) fn rnd(mut self, rnd: Rnd) -> Self {
        self.policy.rnd = rnd;
        self
    }

    /// Builds the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}
