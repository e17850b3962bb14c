//! Retry and failure policy for task instances
//!
//! The decision is a pure function of how many attempts have been made, the
//! task's [`RetryPolicy`] and the outcome of the latest attempt. Nothing here
//! touches the store; the executor and the scheduler's heartbeat reaper both
//! call [`RetryPolicy::decide`] and persist the result.
//!
//! # Example
//!
//! ```
//! use tributary::retry::{Backoff, Decision, Outcome, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(2, Duration::from_secs(30), Backoff::Linear, Duration::from_secs(600));
//!
//! // First attempt failed: retry after 30s
//! assert_eq!(policy.decide(1, Outcome::Failure), Decision::Retry(Duration::from_secs(30)));
//! // Third attempt failed: retries exhausted
//! assert_eq!(policy.decide(3, Outcome::Failure), Decision::Fail);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Growth of the delay between consecutive attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Always `retry_delay`
    Fixed,
    /// `retry_delay * attempt`
    #[default]
    Linear,
    /// `retry_delay * 2^(attempt - 1)`
    Exponential,
}

/// Retry settings resolved for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Retries allowed after the first attempt
    /// * `retry_delay` - Base delay
    /// * `backoff` - Growth strategy for the delay
    /// * `max_delay` - Upper bound for any delay
    pub fn new(
        max_retries: u32,
        retry_delay: Duration,
        backoff: Backoff,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            retry_delay,
            backoff,
            max_delay,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Decide what happens after attempt number `attempt` (1-based) ended with
    /// `outcome`.
    ///
    /// A failure is retried while `attempt <= max_retries`, so a policy with
    /// `max_retries = 1` allows exactly two attempts.
    pub fn decide(&self, attempt: u32, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success => Decision::Succeed,
            Outcome::Failure if attempt <= self.max_retries => {
                Decision::Retry(self.delay_for(attempt))
            }
            Outcome::Failure => Decision::Fail,
        }
    }

    /// Delay before the attempt that follows attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.retry_delay.as_millis().min(u64::MAX as u128) as u64;

        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            }
        };

        let delay = Duration::from_millis(millis).min(self.max_delay);

        debug!(
            "Calculated {:?} backoff delay: {:?} (attempt {})",
            self.backoff, delay, attempt
        );

        delay
    }
}

impl Default for RetryPolicy {
    /// No retries, 5 minute linear delay capped at one hour
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(300),
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Result of one attempt as seen by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// What to do with a task instance after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Schedule another attempt after the delay
    Retry(Duration),
    /// Attempts exhausted
    Fail,
    Succeed,
}
