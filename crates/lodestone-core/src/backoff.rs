//! Exponential backoff with jitter for worker-side retries.
//!
//! Used by the vectorization worker around embedding calls and by the
//! driver client when re-establishing a socket connection. Delays grow
//! geometrically from `initial_delay` up to `max_delay`, with optional
//! random jitter to avoid thundering-herd retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

// powi overflows f64 range long before this many doublings
const MAX_EXPONENT: u32 = 31;

/// Policy describing how retry delays grow between attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any computed delay (before jitter)
    pub max_delay: Duration,
    /// Geometric growth factor, clamped to >= 1.0
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay, clamped to 0.0..=1.0
    pub jitter_percent: f64,
    /// Maximum number of attempts; `None` retries indefinitely
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(20),
            multiplier: 2.0,
            jitter_percent: 0.15,
            max_attempts: Some(5),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy, clamping the multiplier and jitter to sane ranges.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy used for short connection retries: quick, few attempts.
    #[must_use]
    pub fn for_connect() -> Self {
        Self::new(
            Duration::from_millis(50),
            Duration::from_secs(2),
            2.0,
            0.2,
            Some(4),
        )
    }

    /// Compute the delay for a retry attempt (0-based).
    ///
    /// Attempt 0 yields `initial_delay`, each subsequent attempt multiplies
    /// by `multiplier`, capped at `max_delay`. Jitter then perturbs the
    /// capped value by up to `jitter_percent` in either direction.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.as_millis() as f64;
        let mut delay_ms = (self.initial_delay.as_millis() as f64)
            * self.multiplier.powi(attempt.min(MAX_EXPONENT) as i32);
        delay_ms = delay_ms.min(ceiling);

        if self.jitter_percent > 0.0 {
            let spread = delay_ms * self.jitter_percent;
            delay_ms += rand::rng().random_range(-spread..=spread);
        }

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// True when `attempt` (0-based) has exhausted the attempt budget.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt + 1 >= max)
    }
}

/// Outcome of a retried operation, with attempt accounting.
#[derive(Debug)]
pub struct BackoffOutcome<T> {
    /// Final result of the operation
    pub result: T,
    /// Number of attempts made (1 = succeeded first try)
    pub attempts: u32,
    /// Total elapsed time including sleeps
    pub elapsed: Duration,
}

fn finish<T>(result: T, attempts: u32, started: std::time::Instant) -> BackoffOutcome<T> {
    BackoffOutcome {
        result,
        attempts,
        elapsed: started.elapsed(),
    }
}

/// Run an operation with retries governed by `policy`.
///
/// Each failure sleeps `delay_for_attempt` before the next try. The final
/// error is returned once the attempt budget is exhausted.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_backoff_outcome(policy, operation_name, &mut operation)
        .await
        .result
}

/// Like [`with_backoff`] but reports attempt counts and elapsed time.
pub async fn with_backoff_outcome<T, E, F, Fut>(
    policy: &BackoffPolicy,
    operation_name: &str,
    operation: &mut F,
) -> BackoffOutcome<Result<T, E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = std::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return finish(Ok(value), attempt + 1, started),
            Err(err) => err,
        };

        if policy.is_exhausted(attempt) {
            tracing::warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %err,
                "giving up after final attempt"
            );
            return finish(Err(err), attempt + 1, started);
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(
            operation = operation_name,
            attempt = attempt + 1,
            delay = ?delay,
            error = %err,
            "attempt failed; backing off"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(initial_ms: u64, max_ms: u64, multiplier: f64) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            multiplier,
            0.0,
            Some(6),
        )
    }

    // ---- delay computation ----

    #[test]
    fn delays_grow_geometrically_without_jitter() {
        let policy = fixed(10, 100_000, 3.0);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(90));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(270));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = fixed(100, 450, 2.0);
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(450));
        assert_eq!(policy.delay_for_attempt(31), Duration::from_millis(450));
        // attempts beyond the exponent cap still hit the ceiling
        assert_eq!(
            policy.delay_for_attempt(u32::MAX),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(400),
            Duration::from_millis(400),
            2.0,
            0.25,
            None,
        );
        for _ in 0..64 {
            let d = policy.delay_for_attempt(0).as_millis() as i64;
            assert!((300..=500).contains(&d), "delay {d} outside jitter bounds");
        }
    }

    #[test]
    fn multiplier_below_one_never_shrinks_delays() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(80),
            Duration::from_millis(800),
            0.25,
            0.0,
            None,
        );
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(80));
    }

    #[test]
    fn is_exhausted_respects_budget() {
        let policy = fixed(1, 10, 2.0); // max_attempts = 6
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(11));

        let unlimited = BackoffPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
            0.0,
            None,
        );
        assert!(!unlimited.is_exhausted(u32::MAX - 1));
    }

    #[test]
    fn default_policy_is_sane() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(20));
        assert_eq!(policy.max_attempts, Some(5));
    }

    // ---- with_backoff behavior ----

    #[tokio::test]
    async fn succeeds_first_try_without_sleeping() {
        let policy = fixed(1, 10, 2.0);
        let tries = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&tries);

        let result: Result<u32, String> = with_backoff(&policy, "noop", move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(41)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 41);
        assert_eq!(tries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = fixed(1, 5, 2.0);
        let tries = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&tries);

        let outcome = with_backoff_outcome(&policy, "flaky", &mut move || {
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 4);
        assert_eq!(tries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            0.0,
            Some(2),
        );
        let tries = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&tries);

        let result: Result<(), String> = with_backoff(&policy, "doomed", move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("still broken".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "still broken");
        assert_eq!(tries.load(Ordering::SeqCst), 2);
    }

    // ---- property tests ----

    proptest! {
        #[test]
        fn delay_never_exceeds_max_with_jitter_margin(
            initial_ms in 1u64..4_000,
            max_ms in 1u64..50_000,
            multiplier in 1.0f64..8.0,
            jitter in 0.0f64..1.0,
            attempt in 0u32..48,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                multiplier,
                jitter,
                None,
            );
            let effective_max = initial_ms.max(max_ms) as f64 * (1.0 + jitter) + 1.0;
            let delay = policy.delay_for_attempt(attempt).as_millis() as f64;
            prop_assert!(delay <= effective_max, "delay {delay} > {effective_max}");
        }

        #[test]
        fn delays_monotone_without_jitter(
            initial_ms in 1u64..1_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..30,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_secs(7200),
                multiplier,
                0.0,
                None,
            );
            let a = policy.delay_for_attempt(attempt);
            let b = policy.delay_for_attempt(attempt + 1);
            prop_assert!(b >= a);
        }
    }
}
