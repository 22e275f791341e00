//! Retry policy: exponential backoff with jitter, capped, with dead-lettering.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use pagequeue_core::{after, never};

use super::types::QueueRecord;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay window after the first failure
    pub base_delay: Duration,
    /// Cap on the un-jittered window
    pub max_delay: Duration,
    /// Retriable failures tolerated before a forced dead letter
    pub max_attempts: u32,
    /// Lower bound of the multiplicative jitter factor
    pub jitter_min: f64,
    /// Upper bound of the multiplicative jitter factor
    pub jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60 * 60),
            max_attempts: 8,
            jitter_min: 0.5,
            jitter_max: 1.5,
        }
    }
}

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The worker reported a non-retriable failure
    Permanent,
    /// The attempt count passed `max_attempts`
    AttemptsExhausted,
}

/// What to do with a record after a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    Retry { attempt: u32, delay: Duration },
    DeadLetter { attempt: u32, reason: DeadLetterReason },
}

impl RetryPolicy {
    /// Exponential policy with the default jitter range.
    pub fn exponential(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            ..Default::default()
        }
    }

    /// Same policy with jitter disabled (factor fixed at 1.0).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_min = 1.0;
        self.jitter_max = 1.0;
        self
    }

    /// Un-jittered window for a record that had failed `attempt` times before
    /// the current failure: `min(base * 2^attempt, max_delay)`.
    pub fn window_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Scale `window` by a uniform factor in `[jitter_min, jitter_max]`.
    pub fn jittered<R: Rng + ?Sized>(&self, window: Duration, rng: &mut R) -> Duration {
        let factor = if self.jitter_max > self.jitter_min {
            rng.gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        Duration::try_from_secs_f64(window.as_secs_f64() * factor.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Decide the fate of a record that had failed `attempt` times and just failed again.
    pub fn decide<R: Rng + ?Sized>(&self, attempt: u32, retriable: bool, rng: &mut R) -> BackoffDecision {
        if !retriable {
            return BackoffDecision::DeadLetter {
                attempt,
                reason: DeadLetterReason::Permanent,
            };
        }

        let next = attempt.saturating_add(1);
        if next > self.max_attempts {
            return BackoffDecision::DeadLetter {
                attempt: next,
                reason: DeadLetterReason::AttemptsExhausted,
            };
        }

        BackoffDecision::Retry {
            attempt: next,
            delay: self.jittered(self.window_for(attempt), rng),
        }
    }

    /// Apply a failure to `record` in place and return the decision taken.
    pub fn apply_failure<R: Rng + ?Sized>(
        &self,
        record: &mut QueueRecord,
        message: &str,
        retriable: bool,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> BackoffDecision {
        let decision = self.decide(record.attempt, retriable, rng);

        record.last_error = Some(message.to_string());
        record.last_updated_at = now;
        match decision {
            BackoffDecision::Retry { attempt, delay } => {
                record.attempt = attempt;
                record.next_attempt_at = after(now, delay);
            }
            BackoffDecision::DeadLetter { attempt, .. } => {
                record.attempt = attempt;
                record.next_attempt_at = never();
            }
        }

        decision
    }
}
