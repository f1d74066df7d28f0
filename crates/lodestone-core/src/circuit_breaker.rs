//! Failure guard around the embedding service call.
//!
//! The vectorization worker owns one breaker per process. Consecutive
//! failures trip it open; while open every poll is skipped until the
//! cooldown elapses, then a limited number of probe calls decide whether
//! the service has recovered. Breaker state is process-local and resets
//! on worker restart.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Thresholds and cooldown for one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Probe successes required to close again.
    pub success_threshold: u32,
    /// How long to stay open before probing.
    pub open_cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Thresholds below one would trip on success or never close, so both
    /// are clamped.
    #[must_use]
    pub fn new(failure_threshold: u32, success_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_cooldown,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new(5, 2, Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { since: Instant },
    Probing { passes: u32 },
}

/// Breaker state as reported to status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker, serializable for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_cooldown_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open_successes: Option<u32>,
}

/// The breaker itself. Not shared: each worker mutates its own.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: State,
    strikes: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: State::Closed,
            strikes: 0,
        }
    }

    /// Decide whether the next call may proceed.
    ///
    /// Open breakers answer `false` until the cooldown has elapsed, at
    /// which point the breaker moves to probing and lets calls through.
    pub fn allow(&mut self) -> bool {
        let State::Open { since } = self.state else {
            return true;
        };
        if since.elapsed() < self.config.open_cooldown {
            return false;
        }
        self.state = State::Probing { passes: 0 };
        debug!(circuit = %self.name, "cooldown elapsed, probing");
        true
    }

    pub fn record_success(&mut self) {
        match self.state {
            State::Closed => self.strikes = 0,
            State::Probing { passes } => {
                let passes = passes + 1;
                if passes < self.config.success_threshold {
                    self.state = State::Probing { passes };
                } else {
                    self.state = State::Closed;
                    self.strikes = 0;
                    info!(circuit = %self.name, probes = passes, "breaker closed");
                }
            }
            // a success reported while open belongs to a call that started
            // before the trip; the cooldown still stands
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            State::Closed => {
                self.strikes = self.strikes.saturating_add(1);
                if self.strikes >= self.config.failure_threshold {
                    self.trip("consecutive failures");
                }
            }
            State::Probing { .. } => self.trip("probe failed"),
            State::Open { .. } => {}
        }
    }

    fn trip(&mut self, reason: &str) {
        self.state = State::Open {
            since: Instant::now(),
        };
        warn!(
            circuit = %self.name,
            strikes = self.strikes,
            threshold = self.config.failure_threshold,
            cooldown_ms = as_ms(self.config.open_cooldown),
            "breaker tripped: {reason}"
        );
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let mut status = CircuitBreakerStatus {
            state: CircuitStateKind::Closed,
            consecutive_failures: self.strikes,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_cooldown_ms: as_ms(self.config.open_cooldown),
            open_for_ms: None,
            cooldown_remaining_ms: None,
            half_open_successes: None,
        };
        match self.state {
            State::Closed => {}
            State::Open { since } => {
                let elapsed = since.elapsed();
                status.state = CircuitStateKind::Open;
                status.open_for_ms = Some(as_ms(elapsed));
                status.cooldown_remaining_ms =
                    Some(as_ms(self.config.open_cooldown.saturating_sub(elapsed)));
            }
            State::Probing { passes } => {
                status.state = CircuitStateKind::HalfOpen;
                status.half_open_successes = Some(passes);
            }
        }
        status
    }
}

fn as_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::with_name(
            "embedding",
            CircuitBreakerConfig::new(failures, successes, cooldown),
        )
    }

    #[test]
    fn trips_open_after_strike_threshold() {
        let mut b = breaker(3, 1, Duration::from_secs(60));

        b.record_failure();
        b.record_failure();
        assert!(b.allow(), "two strikes of three must not trip");
        assert_eq!(b.status().consecutive_failures, 2);

        b.record_failure();
        assert!(!b.allow());
        assert_eq!(b.status().state, CircuitStateKind::Open);
    }

    #[test]
    fn blocks_for_the_whole_cooldown() {
        let mut b = breaker(1, 1, Duration::from_secs(60));
        b.record_failure();

        assert!(!b.allow());
        assert!(!b.allow(), "repeated checks must not shorten the cooldown");

        let status = b.status();
        assert!(status.open_for_ms.is_some());
        assert!(status.cooldown_remaining_ms.unwrap() <= 60_000);
    }

    #[test]
    fn probes_after_cooldown_and_closes_on_enough_passes() {
        let mut b = breaker(1, 2, Duration::ZERO);
        b.record_failure();

        assert!(b.allow(), "zero cooldown probes immediately");
        assert_eq!(b.status().state, CircuitStateKind::HalfOpen);

        b.record_success();
        let status = b.status();
        assert_eq!(status.state, CircuitStateKind::HalfOpen);
        assert_eq!(status.half_open_successes, Some(1));

        b.record_success();
        assert_eq!(b.status().state, CircuitStateKind::Closed);
        assert_eq!(b.status().consecutive_failures, 0);
    }

    #[test]
    fn probe_failure_reopens() {
        let mut b = breaker(1, 1, Duration::ZERO);
        b.record_failure();
        assert!(b.allow());

        b.record_failure();
        assert_eq!(b.status().state, CircuitStateKind::Open);
    }

    #[test]
    fn success_resets_strikes_while_closed() {
        let mut b = breaker(3, 1, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.status().consecutive_failures, 0);

        // the count starts over
        b.record_failure();
        b.record_failure();
        assert_eq!(b.status().state, CircuitStateKind::Closed);
    }

    #[test]
    fn late_success_while_open_changes_nothing() {
        let mut b = breaker(1, 1, Duration::from_secs(60));
        b.record_failure();
        b.record_success();

        assert_eq!(b.status().state, CircuitStateKind::Open);
        assert!(!b.allow());
    }

    #[test]
    fn zero_thresholds_are_clamped() {
        let config = CircuitBreakerConfig::new(0, 0, Duration::ZERO);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.success_threshold, 1);
    }

    #[test]
    fn status_serializes_snake_case_states() {
        let mut b = breaker(1, 1, Duration::from_secs(60));
        b.record_failure();

        let json = serde_json::to_string(&b.status()).unwrap();
        assert!(json.contains("\"state\":\"open\""));

        let back: CircuitBreakerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, CircuitStateKind::Open);
        assert_eq!(back.consecutive_failures, 1);
    }
}
