//! Bounded retry with exponential backoff.
//!
//! The policy is a plain value so it can be tested without I/O; the
//! controller owns the sleep/attempt loop and is the only place backoff
//! lives — the scheduler never retries on its own.

use crate::errors::{EngineError, ErrorKind};
use crate::operation::OperationResult;
use crate::telemetry::{CancelSignal, ProgressEvent, Stage, TelemetryPublisher};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Retry configuration for one class of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never exceeded.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "crate::operation::duration_millis")]
    pub base_delay: Duration,
    /// Multiplier applied per retry.
    pub multiplier: f64,
    /// Cap on any single delay.
    #[serde(with = "crate::operation::duration_millis")]
    pub max_delay: Duration,
    /// Randomization applied to each delay, as a fraction of it (0.0..=1.0).
    pub jitter_fraction: f64,
    /// Error kinds worth retrying. Anything else is fatal for the step.
    pub retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
            retryable: HashSet::from([ErrorKind::Transient]),
        }
    }
}

impl RetryPolicy {
    /// Smaller, faster policy for compensating actions during rollback.
    pub fn for_rollback() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Backoff before retry number `attempt` (1-based), without jitter:
    /// `min(base * multiplier^(attempt-1), max_delay)`. Monotone
    /// non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay_for_attempt` with ± `jitter_fraction` randomization applied,
    /// still capped at `max_delay`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_fraction;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (base.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

/// Outcome of a retried execution: the result or final error, plus how many
/// attempts were consumed (recorded on the step).
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<OperationResult, EngineError>,
    pub attempts: u32,
}

/// Wraps executor calls in the retry policy. Holds no I/O of its own.
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    telemetry: TelemetryPublisher,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, telemetry: TelemetryPublisher) -> Self {
        Self { policy, telemetry }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt_fn` until it succeeds, exhausts the policy, hits a
    /// non-retryable error, or the session is cancelled. The backoff sleep
    /// aborts immediately on cancellation.
    pub async fn execute<F, Fut>(
        &self,
        session_id: Uuid,
        step_id: &str,
        cancel: &CancelSignal,
        mut attempt_fn: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<OperationResult, EngineError>>,
    {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(EngineError::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            match attempt_fn(attempts).await {
                Ok(result) => {
                    return RetryOutcome {
                        result: Ok(result),
                        attempts,
                    }
                }
                Err(err) => {
                    let kind = err.kind();
                    let exhausted = attempts >= self.policy.max_attempts;
                    if kind == ErrorKind::Cancelled
                        || !self.policy.is_retryable(kind)
                        || exhausted
                    {
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                        };
                    }

                    let delay = self.policy.jittered_delay(attempts);
                    tracing::debug!(
                        step = step_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    self.telemetry.emit(
                        ProgressEvent::for_step(
                            session_id,
                            step_id,
                            Stage::RetryScheduled,
                            format!(
                                "attempt {attempts} failed ({err}); retrying in {}ms",
                                delay.as_millis()
                            ),
                        )
                        .with_metrics(serde_json::json!({
                            "attempt": attempts,
                            "delay_ms": delay.as_millis() as u64,
                        })),
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return RetryOutcome {
                                result: Err(EngineError::Cancelled),
                                attempts,
                            };
                        }
                    }
                }
            }
        }
    }
}
