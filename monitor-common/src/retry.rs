//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure backoff between attempts of an
//! external call.
use std::time;

use rand::Rng;

#[derive(Clone, Debug)]
/// A retry policy to determine how long to wait before the next attempt of a failed call.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Fraction of the interval (0.0 to 1.0) randomly added or removed to spread out retries.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine interval for retrying at a given attempt number.
    /// If not `None`, this method will respect `preferred_retry_interval` as long as it falls within `candidate_interval <= preferred_retry_interval <= maximum_interval`.
    pub fn retry_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt.saturating_sub(1)));

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(duration), Some(max_interval)) => {
                let min_interval_allowed = std::cmp::min(candidate_interval, max_interval);

                if min_interval_allowed <= duration && duration <= max_interval {
                    duration
                } else {
                    min_interval_allowed
                }
            }
            (Some(duration), None) => std::cmp::max(candidate_interval, duration),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }

    /// Same as `retry_interval`, spread by up to `jitter` in either direction.
    /// An interval preferred by the remote end is never shortened.
    pub fn jittered_interval(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<time::Duration>,
    ) -> time::Duration {
        let interval = self.retry_interval(attempt, preferred_retry_interval);
        if self.jitter <= 0.0 || interval.is_zero() {
            return interval;
        }

        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        let jittered = interval.mul_f64(factor);

        match preferred_retry_interval {
            Some(preferred) if preferred == interval => std::cmp::max(jittered, preferred),
            _ => jittered,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
    /// Fraction of the interval randomly added or removed.
    pub jitter: f64,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            jitter: 0.0,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn jitter(mut self, jitter: f64) -> RetryPolicyBuilder {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter: self.jitter,
        }
    }
}
