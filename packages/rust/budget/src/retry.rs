//! Retry with exponential backoff for provider calls.
//!
//! Errors are split into retryable and fatal by the [`Classify`] trait.
//! Backoff never sleeps past the run's wall-time deadline.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use listscout_shared::{ProviderError, RetryConfig};
use rand::Rng;
use tracing::{debug, warn};

use crate::BudgetTracker;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Error types the executor knows how to handle.
pub trait Classify {
    fn classify(&self) -> ErrorClass;

    /// Minimum delay requested by the server before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Spend incurred by the failed attempt.
    fn spent_usd(&self) -> f64 {
        0.0
    }
}

impl Classify for ProviderError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::Network(_) | Self::Timeout => {
                ErrorClass::Retryable
            }
            Self::Unauthorized(_)
            | Self::BadRequest(_)
            | Self::BudgetRefused(_)
            | Self::MalformedResponse { .. } => ErrorClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    fn spent_usd(&self) -> f64 {
        self.cost_usd()
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_index` (0 = first retry).
    ///
    /// `jitter_sample` is in `[-1, 1]` and scales the configured jitter.
    pub fn delay_for(
        &self,
        retry_index: u32,
        hint: Option<Duration>,
        jitter_sample: f64,
    ) -> Duration {
        let exp = 2f64.powi(retry_index.min(30) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let jittered = (base * (1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0))).max(0.0);
        let mut delay = Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()));
        if let Some(hint) = hint {
            delay = delay.max(hint);
        }
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    /// Attempts actually made (at least 1).
    pub attempts: u32,
    /// Spend reported by failed attempts; the caller commits it.
    pub failed_cost_usd: f64,
}

/// Runs fallible async operations with classification-aware backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    budget: Arc<BudgetTracker>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, budget: Arc<BudgetTracker>) -> Self {
        Self { policy, budget }
    }

    /// Call `op` until it succeeds, fails fatally, runs out of attempts, or
    /// the run's wall time is exhausted.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempts = 0u32;
        let mut failed_cost_usd = 0.0;

        loop {
            attempts += 1;
            let err = match op().await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts,
                        failed_cost_usd,
                    };
                }
                Err(err) => err,
            };

            failed_cost_usd += err.spent_usd().max(0.0);

            if err.classify() == ErrorClass::Fatal {
                debug!(task = label, attempts, error = %err, "fatal error, not retrying");
                break Attempted {
                    result: Err(err),
                    attempts,
                    failed_cost_usd,
                };
            }

            if attempts >= self.policy.max_attempts {
                warn!(task = label, attempts, error = %err, "retry attempts exhausted");
                break Attempted {
                    result: Err(err),
                    attempts,
                    failed_cost_usd,
                };
            }

            let remaining = self.budget.remaining_wall_time();
            if remaining.is_zero() {
                warn!(task = label, attempts, error = %err, "wall time exhausted, not retrying");
                break Attempted {
                    result: Err(err),
                    attempts,
                    failed_cost_usd,
                };
            }

            let sample = if self.policy.jitter > 0.0 {
                rand::thread_rng().gen_range(-1.0..=1.0)
            } else {
                0.0
            };
            let delay = self
                .policy
                .delay_for(attempts - 1, err.retry_after(), sample)
                .min(remaining);

            warn!(
                task = label,
                attempt = attempts,
                max = self.policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            tokio::time::sleep(delay).await;

            if self.budget.remaining_wall_time().is_zero() {
                warn!(task = label, attempts, error = %err, "wall time ran out during backoff");
                break Attempted {
                    result: Err(err),
                    attempts,
                    failed_cost_usd,
                };
            }
        }
    }
}
