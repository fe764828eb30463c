//! Retry and backoff policy for network-bound operations
//!
//! Only errors classified as transient or integrity failures are retried.
//! Authentication, validation, capacity and state-conflict errors surface
//! immediately.
//!
//! # Examples
//!
//! ```no_run
//! use orbit_mpu::retry::{with_retry, BackoffStrategy, RetryPolicy};
//! use orbit_mpu::MpuError;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), MpuError> {
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(100),
//!     backoff: BackoffStrategy::ExponentialWithJitter,
//!     ..Default::default()
//! };
//!
//! let value = with_retry(&policy, "ping", || async { Ok::<_, MpuError>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{MpuError, MpuResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Hard ceiling on total time spent across attempts and delays
    pub max_elapsed: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(300),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy for network-flaky scenarios
    pub fn network() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(600),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
        }
    }

    /// Calculate delay for a given attempt number (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(attempt - 1);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Fixed => self.initial_delay,
        };

        let capped_delay = base_delay.min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter)
            && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            let jitter_amount = capped_delay.as_secs_f64() * jitter;
            capped_delay + Duration::from_secs_f64(jitter_amount)
        } else {
            capped_delay
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    ExponentialWithJitter,
}

/// Attempt bookkeeping for one retried operation.
///
/// Callers that need to do work between attempts (the commit path re-queries
/// the session) drive this directly instead of going through [`with_retry`].
#[derive(Debug)]
pub struct RetryBudget<'a> {
    policy: &'a RetryPolicy,
    operation: String,
    attempts: u32,
    started: Instant,
}

impl<'a> RetryBudget<'a> {
    /// Start a budget for `operation`
    pub fn new(policy: &'a RetryPolicy, operation: impl Into<String>) -> Self {
        Self {
            policy,
            operation: operation.into(),
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Number of attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or the error to
    /// surface: the original error if it is not retryable, otherwise
    /// `ExhaustedRetries` once attempts or elapsed time run out.
    pub fn on_failure(&mut self, error: MpuError) -> Result<Duration, MpuError> {
        self.attempts += 1;

        if !error.is_retryable() {
            return Err(error);
        }

        let delay = self.policy.calculate_delay(self.attempts);
        let elapsed = self.started.elapsed();

        if self.attempts >= self.policy.max_attempts || elapsed + delay > self.policy.max_elapsed {
            warn!(
                operation = %self.operation,
                attempts = self.attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "retry budget exhausted: {}",
                error
            );
            return Err(MpuError::ExhaustedRetries {
                operation: self.operation.clone(),
                attempts: self.attempts,
                elapsed,
                last: Box::new(error),
            });
        }

        debug!(
            operation = %self.operation,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying after error: {}",
            error
        );
        Ok(delay)
    }
}

/// Execute an operation with retry logic
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> MpuResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MpuResult<T>>,
{
    let mut budget = RetryBudget::new(policy, operation);

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = budget.on_failure(e)?;
                sleep(delay).await;
            }
        }
    }
}
