use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    fn as_gauge(&self) -> f64 {
        match self {
            CircuitBreakerState::Closed => 0.0,
            CircuitBreakerState::Open => 1.0,
            CircuitBreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures older than this no longer count towards the threshold.
    pub failure_window: Duration,
    /// How long the circuit stays open before admitting a trial.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen { trial_started: Instant },
}

/// Circuit breaker guarding one remote endpoint.
///
/// Every method takes the current instant so the state machine can be driven without sleeping.
/// A trial admitted in half-open state that never reports back (its future was dropped) is
/// considered lost after `open_duration`, and a new trial is admitted.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.to_owned(),
            config,
            state: Mutex::new(State::Closed {
                failures: VecDeque::new(),
            }),
        };
        breaker.report(CircuitBreakerState::Closed);
        breaker
    }

    /// Whether a call may go out now. Admitting the first call after the open period moves the
    /// circuit to half-open, and that call is the trial.
    pub fn allow(&self, now: Instant) -> bool {
        let mut state = self.lock();

        match *state {
            State::Closed { .. } => true,
            State::Open { until } if now >= until => {
                *state = State::HalfOpen { trial_started: now };
                info!("circuit breaker '{}' half-open, admitting a trial", self.name);
                self.report(CircuitBreakerState::HalfOpen);
                true
            }
            State::Open { .. } => false,
            State::HalfOpen { trial_started } => {
                if now.saturating_duration_since(trial_started) >= self.config.open_duration {
                    *state = State::HalfOpen { trial_started: now };
                    warn!("circuit breaker '{}' lost its trial, admitting another", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether `allow` would admit a call at `now`, without changing the state.
    pub fn is_accepting(&self, now: Instant) -> bool {
        match *self.lock() {
            State::Closed { .. } => true,
            State::Open { until } => now >= until,
            State::HalfOpen { trial_started } => {
                now.saturating_duration_since(trial_started) >= self.config.open_duration
            }
        }
    }

    /// Record that the endpoint answered. Any answer proves it reachable, so the failure
    /// streak is reset and a half-open circuit closes.
    pub fn record_success(&self, _now: Instant) {
        let mut state = self.lock();

        match &mut *state {
            State::Closed { failures } => failures.clear(),
            State::HalfOpen { .. } => {
                *state = State::Closed {
                    failures: VecDeque::new(),
                };
                info!("circuit breaker '{}' closed after a successful trial", self.name);
                self.report(CircuitBreakerState::Closed);
            }
            // A call admitted before the circuit opened.
            State::Open { .. } => (),
        }
    }

    /// Record that the endpoint could not be reached.
    pub fn record_failure(&self, now: Instant) {
        let mut state = self.lock();

        match &mut *state {
            State::Closed { failures } => {
                let window = self.config.failure_window;
                while failures
                    .front()
                    .is_some_and(|first| now.saturating_duration_since(*first) > window)
                {
                    failures.pop_front();
                }
                failures.push_back(now);

                if failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        "circuit breaker '{}' opened after {} consecutive failures",
                        self.name,
                        failures.len()
                    );
                    *state = State::Open {
                        until: now + self.config.open_duration,
                    };
                    self.report(CircuitBreakerState::Open);
                }
            }
            State::HalfOpen { .. } => {
                warn!("circuit breaker '{}' re-opened after a failed trial", self.name);
                *state = State::Open {
                    until: now + self.config.open_duration,
                };
                self.report(CircuitBreakerState::Open);
            }
            State::Open { .. } => (),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        match *self.lock() {
            State::Closed { .. } => CircuitBreakerState::Closed,
            State::Open { .. } => CircuitBreakerState::Open,
            State::HalfOpen { .. } => CircuitBreakerState::HalfOpen,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // No code path panics while holding the lock, so a poisoned state is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, state: CircuitBreakerState) {
        let labels = [("name", self.name.clone())];
        metrics::gauge!("monitor_oracle_circuit_state", &labels).set(state.as_gauge());
        metrics::counter!(
            "monitor_oracle_circuit_transitions_total",
            &[("name", self.name.clone()), ("to", format!("{:?}", state))]
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "oracle",
            CircuitBreakerConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                open_duration: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker();
        let start = Instant::now();

        for _ in 0..2 {
            assert!(breaker.allow(start));
            breaker.record_failure(start);
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);

        breaker.record_failure(start);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(!breaker.allow(start + Duration::from_secs(29)));
        assert!(!breaker.is_accepting(start + Duration::from_secs(29)));
    }

    #[test]
    fn test_success_resets_the_streak() {
        let breaker = breaker();
        let now = Instant::now();

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success(now);
        breaker.record_failure(now);
        breaker.record_failure(now);

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_failures_outside_the_window_do_not_count() {
        let breaker = breaker();
        let start = Instant::now();

        breaker.record_failure(start);
        breaker.record_failure(start + Duration::from_secs(10));
        breaker.record_failure(start + Duration::from_secs(71));

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);

        breaker.record_failure(start + Duration::from_secs(72));
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
    }

    #[test]
    fn test_half_open_admits_a_single_trial() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        let later = start + Duration::from_secs(30);
        assert!(breaker.is_accepting(later));
        assert!(breaker.allow(later));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        assert!(!breaker.allow(later));
        assert!(!breaker.allow(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        let later = start + Duration::from_secs(31);
        assert!(breaker.allow(later));
        breaker.record_success(later);

        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert!(breaker.allow(later));
        assert!(breaker.allow(later));
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        let later = start + Duration::from_secs(31);
        assert!(breaker.allow(later));
        breaker.record_failure(later);

        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(!breaker.allow(later + Duration::from_secs(29)));
        assert!(breaker.allow(later + Duration::from_secs(30)));
    }

    #[test]
    fn test_lost_trial_is_replaced() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure(start);
        }

        let trial = start + Duration::from_secs(30);
        assert!(breaker.allow(trial));
        assert!(!breaker.allow(trial + Duration::from_secs(10)));
        assert!(breaker.allow(trial + Duration::from_secs(30)));
    }
}
