//! Retry controller: bounded attempts with a fixed delay between them.
//!
//! Each attempt is classified into an `AttemptResult`. Transport, status and
//! no-match failures are all retryable within the same budget unless
//! `no_match_is_permanent` is set.
//!
//! Epistemic foundation:
//! - K_i: Attempts per item never exceed `max_attempts`
//! - B_i: A `Retry-After` hint may stretch the delay → Option<Duration>
//! - I^B: Whether a failure is transient is unknowable → retry within budget

use crate::client::StageError;
use crate::models::{EngineConfig, ResolveError, ResolvedRecord, Result};
use crate::pool::ShutdownSignal;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Classified outcome of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Success(ResolvedRecord),
    Retryable(StageError),
    Permanent(StageError),
}

/// Final outcome for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        record: ResolvedRecord,
        attempts: u32,
    },
    Failure {
        error: StageError,
        attempts: u32,
    },
}

impl Outcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Success { attempts, .. } | Outcome::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First attempt plus retries
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub no_match_is_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            no_match_is_permanent: false,
        }
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
            no_match_is_permanent: config.no_match_is_permanent,
        }
    }
}

impl RetryPolicy {
    /// Classify the raw result of one attempt.
    pub fn classify(&self, result: std::result::Result<ResolvedRecord, StageError>) -> AttemptResult {
        match result {
            Ok(record) => AttemptResult::Success(record),
            Err(e) if self.no_match_is_permanent && matches!(e.error, ResolveError::NoMatch { .. }) => {
                AttemptResult::Permanent(e)
            }
            Err(e) => AttemptResult::Retryable(e),
        }
    }

    /// Delay before the next attempt: the fixed delay, stretched by a
    /// server-provided hint.
    fn delay_after(&self, error: &StageError) -> Duration {
        error
            .error
            .retry_after()
            .map_or(self.retry_delay, |hint| hint.max(self.retry_delay))
    }

    /// Drive `attempt` until success, a permanent failure, or the budget is spent.
    ///
    /// Every attempt and every delay is raced against `shutdown`; cancellation
    /// returns `Err(Cancelled)` and produces no outcome.
    pub async fn resolve<F, Fut>(&self, shutdown: &ShutdownSignal, mut attempt: F) -> Result<Outcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<ResolvedRecord, StageError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            shutdown.check()?;
            attempts += 1;

            let error = match self.classify(shutdown.run(attempt()).await?) {
                AttemptResult::Success(record) => return Ok(Outcome::Success { record, attempts }),
                AttemptResult::Permanent(error) => return Ok(Outcome::Failure { error, attempts }),
                AttemptResult::Retryable(error) => error,
            };

            if attempts >= max_attempts {
                return Ok(Outcome::Failure { error, attempts });
            }

            let delay = self.delay_after(&error);
            debug!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            shutdown.sleep(delay).await?;
        }
    }
}
