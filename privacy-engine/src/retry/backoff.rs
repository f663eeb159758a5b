//! Backoff and jitter for task retries and async polling.
//!
//! Attempt counts live on the persisted task, so delay calculation is a
//! pure function of the attempt number and the configuration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Error-retry behavior for tasks with transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(attempt)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides what to do with a failed attempt.
///
/// `retry_count` is the number of retries already performed.
#[must_use]
pub fn should_retry(retry_count: u32, retryable: bool, config: &RetryConfig) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if retry_count >= config.max_retries {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(config.delay_for(retry_count))
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_polls() -> u32 {
    100
}

/// Polling behavior for async connector jobs, independent of error backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Polls allowed per submission before a poll timeout.
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
        }
    }
}

impl PollConfig {
    /// Sets the poll interval.
    #[must_use]
    pub fn with_interval_ms(mut self, interval: u64) -> Self {
        self.interval_ms = interval;
        self
    }

    /// Sets the poll budget.
    #[must_use]
    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.max_polls = polls;
        self
    }

    /// The fixed delay between polls.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
