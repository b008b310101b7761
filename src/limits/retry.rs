//! Classification-driven retry with capped exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{FinalError, IngestError};
use crate::limits::circuit_breaker::{Admission, CircuitBreaker, Outcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl From<&ProviderConfig> for BackoffPolicy {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts.max(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Short, bounded policy for optimistic storage retries.
    pub fn storage() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(200), 5)
    }

    /// `min(base × 2^(attempt−1), max)`, attempt counted from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Like [`delay_for`](Self::delay_for) but honours a provider `Retry-After`
    /// hint, still capped at `max_delay`.
    pub fn delay_with_hint(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let d = self.delay_for(attempt);
        match hint {
            Some(h) => d.max(h.min(self.max_delay)),
            None => d,
        }
    }
}

/// Runs one logical operation, retrying retryable failures.
///
/// The closure receives the 1-based attempt number. Every final outcome is
/// reported to the attached breaker; storage retries run without one.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    label: String,
    policy: BackoffPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryExecutor {
    pub fn new(label: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            label: label.into(),
            policy,
            breaker: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, FinalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        self.run_inner(None, op).await
    }

    /// [`run`](Self::run) for a call the breaker admitted; the final outcome
    /// is recorded against that admission.
    pub async fn run_admitted<T, F, Fut>(&self, admission: Admission, op: F) -> Result<T, FinalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        self.run_inner(Some(admission), op).await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        admission: Option<Admission>,
        mut op: F,
    ) -> Result<T, FinalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => {
                    self.report(admission, Outcome::Success);
                    return Ok(v);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_with_hint(attempt, e.retry_after());
                    tracing::warn!(
                        target: "ingest",
                        op = %self.label,
                        attempt,
                        kind = %e.kind(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let exhausted = e.is_retryable();
                    let outcome = if exhausted {
                        Outcome::Failure
                    } else if e.kind().is_local_refusal() {
                        Outcome::Abandoned
                    } else {
                        Outcome::Fatal
                    };
                    self.report(admission, outcome);
                    tracing::warn!(
                        target: "ingest",
                        op = %self.label,
                        attempts = attempt,
                        kind = %e.kind(),
                        exhausted,
                        error = %e,
                        "operation failed"
                    );
                    return Err(FinalError {
                        error: e,
                        attempts: attempt,
                        exhausted,
                    });
                }
            }
        }
    }

    fn report(&self, admission: Option<Admission>, outcome: Outcome) {
        match (&self.breaker, admission) {
            (Some(b), Some(a)) => b.record_admitted(a, outcome),
            (Some(b), None) => b.record(outcome),
            (None, _) => {}
        }
    }
}
