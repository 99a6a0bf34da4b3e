//! Per-bot circuit breaker (§4.3): 5 consecutive failures trips the breaker
//! open for 60s, after which a single half-open probe is allowed through.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    state: Mutex<State>,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            state: Mutex::new(State::Closed),
            epoch: Instant::now(),
        }
    }

    /// Returns true if a call is currently permitted through the breaker.
    /// Transitions Open -> HalfOpen once [`OPEN_DURATION`] has elapsed.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            State::Closed => true,
            State::HalfOpen => false,
            State::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::Relaxed);
                let elapsed = self.epoch.elapsed().as_millis() as u64 - opened_at;
                if elapsed >= OPEN_DURATION.as_millis() as u64 {
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        *state = State::Closed;
    }

    pub async fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock().await;
        if *state == State::HalfOpen || failures >= FAILURE_THRESHOLD {
            *state = State::Open;
            self.opened_at_millis
                .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            assert!(breaker.allow().await);
            breaker.record_failure().await;
        }
        assert!(!breaker.allow().await);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        for _ in 0..(FAILURE_THRESHOLD - 1) {
            assert!(breaker.allow().await);
            breaker.record_failure().await;
        }
        assert!(breaker.allow().await);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure().await;
        }
        assert!(!breaker.allow().await);
    }
}
