use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use super::page::{FetchFailure, PageOutcome};

/// Bounded exponential backoff around a single page fetch.
///
/// Transient failures consume the attempt budget with doubling sleeps in
/// between; once the budget is exhausted the page degrades to
/// `TransientFailure`, which the aggregator treats as an absent page (a
/// truncation boundary), not as a stop signal. Fatal failures short-circuit
/// without consuming any budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Delay before the retry following attempt `attempt` (1-based), doubling
    /// each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff * (1u32 << exponent)
    }

    pub async fn run<F, Fut>(&self, mut attempt_fn: F) -> PageOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<PageOutcome, FetchFailure>>,
    {
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            match attempt_fn().await {
                Ok(outcome) => return outcome,
                Err(FetchFailure::Fatal(reason)) => {
                    log::warn!("giving up: {}", reason);
                    return PageOutcome::FatalFailure(reason);
                }
                Err(FetchFailure::Transient(reason)) => {
                    if attempt < self.max_attempts {
                        let delay = self.backoff(attempt);
                        log::warn!(
                            "{} (attempt {}/{}), retrying in {:?}",
                            reason,
                            attempt,
                            self.max_attempts,
                            delay
                        );
                        sleep(delay).await;
                    }
                    last_reason = reason;
                }
            }
        }

        log::warn!(
            "{} after {} attempts, treating page as absent",
            last_reason,
            self.max_attempts
        );
        PageOutcome::TransientFailure(last_reason)
    }
}
