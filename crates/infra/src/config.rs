//! Queue configuration loading and representation.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use pagequeue_core::QueueError;

use crate::queue::RetryPolicy;

/// Configuration was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {key}: {message}")]
pub struct ConfigError {
    pub key: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

impl From<ConfigError> for QueueError {
    fn from(err: ConfigError) -> Self {
        QueueError::config(err.to_string())
    }
}

/// Longest un-jittered retry window accepted. Keeps every backoff due time
/// far below the dead-letter sentinel.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Largest accepted jitter factor.
pub const MAX_JITTER_FACTOR: f64 = 10.0;

/// Tunables of the queue.
///
/// The defaults fit a host that may be suspended a few tens of seconds after
/// going idle; none of them are load-bearing beyond that.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Width of the time bucket used for coalescing
    pub coalesce_window: Duration,
    /// Maximum records taken per tick
    pub batch_size: usize,
    /// Wall-clock budget of one tick; no new record is taken once exceeded
    pub tick_budget: Duration,
    /// Per-record dispatch timeout
    pub dispatch_timeout: Duration,
    /// Period of the external timer driving the tick
    pub alarm_period: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(10 * 60),
            batch_size: 5,
            tick_budget: Duration::from_secs(25),
            dispatch_timeout: Duration::from_secs(20),
            alarm_period: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Load from `PAGEQUEUE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &'static str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };
        let millis = |key: &'static str, default: Duration| {
            let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
            parse_or(&lookup, key, default_ms).map_or(default, Duration::from_millis)
        };

        let config = Self {
            coalesce_window: secs("PAGEQUEUE_COALESCE_WINDOW_SECS", defaults.coalesce_window),
            batch_size: parse_or(&lookup, "PAGEQUEUE_BATCH_SIZE", defaults.batch_size)
                .unwrap_or(defaults.batch_size),
            tick_budget: secs("PAGEQUEUE_TICK_BUDGET_SECS", defaults.tick_budget),
            dispatch_timeout: secs("PAGEQUEUE_DISPATCH_TIMEOUT_SECS", defaults.dispatch_timeout),
            alarm_period: secs("PAGEQUEUE_ALARM_PERIOD_SECS", defaults.alarm_period),
            retry: RetryPolicy {
                base_delay: millis("PAGEQUEUE_RETRY_BASE_MS", defaults.retry.base_delay),
                max_delay: millis("PAGEQUEUE_RETRY_MAX_MS", defaults.retry.max_delay),
                max_attempts: parse_or(&lookup, "PAGEQUEUE_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)
                    .unwrap_or(defaults.retry.max_attempts),
                ..defaults.retry
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget = budget;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_alarm_period(mut self, period: Duration) -> Self {
        self.alarm_period = period;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::new("batch_size", "must be at least 1"));
        }
        if self.tick_budget.is_zero() {
            return Err(ConfigError::new("tick_budget", "must be positive"));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(ConfigError::new("dispatch_timeout", "must be positive"));
        }
        if self.alarm_period.is_zero() {
            return Err(ConfigError::new("alarm_period", "must be positive"));
        }
        if self.retry.max_delay > MAX_RETRY_DELAY {
            return Err(ConfigError::new(
                "retry.max_delay",
                format!("must not exceed {}s", MAX_RETRY_DELAY.as_secs()),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::new("retry.base_delay", "must not exceed retry.max_delay"));
        }
        let jitter_ok = self.retry.jitter_min.is_finite()
            && self.retry.jitter_max.is_finite()
            && self.retry.jitter_min >= 0.0
            && self.retry.jitter_min <= self.retry.jitter_max
            && self.retry.jitter_max <= MAX_JITTER_FACTOR;
        if !jitter_ok {
            return Err(ConfigError::new(
                "retry.jitter",
                format!("bad range [{}, {}]", self.retry.jitter_min, self.retry.jitter_max),
            ));
        }
        Ok(())
    }
}

/// `Some(parsed)` when the key is set and parses, `Some(default)` when unset,
/// `None` (with a warning) when set but unparseable.
fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Some(default),
        Some(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable configuration value");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(QueueConfig::default().validate().is_ok());
        assert_eq!(QueueConfig::from_lookup(lookup(&[])).unwrap(), QueueConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("PAGEQUEUE_BATCH_SIZE", "12"),
            ("PAGEQUEUE_TICK_BUDGET_SECS", "5"),
            ("PAGEQUEUE_RETRY_BASE_MS", "250"),
            ("PAGEQUEUE_RETRY_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 12);
        assert_eq!(config.tick_budget, Duration::from_secs(5));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        let config = QueueConfig::from_lookup(lookup(&[("PAGEQUEUE_BATCH_SIZE", "lots")])).unwrap();
        assert_eq!(config.batch_size, QueueConfig::default().batch_size);
    }

    #[test]
    fn rejects_zero_batch() {
        let err = QueueConfig::from_lookup(lookup(&[("PAGEQUEUE_BATCH_SIZE", "0")])).unwrap_err();
        assert_eq!(err.key, "batch_size");
    }

    #[test]
    fn rejects_inverted_jitter_and_delays() {
        let mut config = QueueConfig::default();
        config.retry.jitter_min = 2.0;
        assert_eq!(config.validate().unwrap_err().key, "retry.jitter");

        let config = QueueConfig::default().with_retry(RetryPolicy::exponential(
            Duration::from_secs(10),
            Duration::from_secs(1),
            3,
        ));
        assert_eq!(config.validate().unwrap_err().key, "retry.base_delay");
    }

    #[test]
    fn rejects_retry_windows_that_reach_the_dead_letter_sentinel() {
        let huge = u64::MAX.to_string();
        let err = QueueConfig::from_lookup(lookup(&[("PAGEQUEUE_RETRY_MAX_MS", huge.as_str())])).unwrap_err();
        assert_eq!(err.key, "retry.max_delay");

        let mut config = QueueConfig::default();
        config.retry.jitter_max = 1e12;
        assert_eq!(config.validate().unwrap_err().key, "retry.jitter");

        let at_cap = QueueConfig::default().with_retry(RetryPolicy::exponential(
            Duration::from_secs(10),
            MAX_RETRY_DELAY,
            8,
        ));
        assert!(at_cap.validate().is_ok());
    }
}
