//! Circuit breaker guarding upstream exchange calls.
//!
//! Per-service, three states:
//!
//! - `CLOSED`: requests flow; consecutive failures are counted.
//! - `OPEN`: requests are rejected without touching the adapter until the
//!   cooldown since the last failure elapses.
//! - `HALF_OPEN`: one probe is allowed; success closes the breaker, any
//!   failure reopens it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Current state, promoting `OPEN -> HALF_OPEN` once the cooldown since
    /// the last failure has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner);
        inner.state
    }

    /// Gate check. `false` means reject without calling the adapter.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner);
        inner.state != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            // A failed probe reopens immediately.
            CircuitState::HalfOpen => inner.state = CircuitState::Open,
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.promote_if_cooled(&mut inner);
        CircuitStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    fn promote_if_cooled(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let cooled = match inner.last_failure_at {
                Some(at) => at.elapsed() >= self.cooldown,
                None => true,
            };
            if cooled {
                inner.state = CircuitState::HalfOpen;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.allow_request());
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(5));
        breaker.record_failure();
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(5));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn reset_clears_everything() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(30));
        breaker.record_failure();
        assert!(!breaker.allow_request());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
