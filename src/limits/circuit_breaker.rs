//! Per-provider circuit breaker.
//!
//! Trips after `failure_threshold` consecutive failures inside the evaluation
//! window, refuses calls for `cooldown`, then lets exactly one trial call
//! through (HalfOpen). The trial's outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ProviderConfig;
use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub evaluation_window: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            evaluation_window: Duration::from_secs(300),
        }
    }
}

impl From<&ProviderConfig> for BreakerPolicy {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            failure_threshold: cfg.circuit_failure_threshold.max(1),
            cooldown: Duration::from_secs(cfg.circuit_cooldown_seconds),
            evaluation_window: Duration::from_secs(cfg.circuit_evaluation_window_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open { opened_at: Instant },
    /// `trial_taken` is set once the single trial call has been let through.
    HalfOpen { trial_taken: bool },
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open { .. } => "open",
            CircuitStatus::HalfOpen { .. } => "half_open",
        }
    }
}

/// What the retry executor reports after a logical call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Retryable failures exhausted the attempt budget.
    Failure,
    /// The provider answered with a non-retryable error; it is alive.
    Fatal,
    /// The call never reached the provider (quota, refused gate).
    Abandoned,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    /// Bumped on every trip and reset; outcomes admitted under an older
    /// epoch no longer move the circuit.
    epoch: u64,
}

/// Handed out by [`CircuitBreaker::check`] for each admitted logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    epoch: u64,
    trial: bool,
}

impl Admission {
    /// Whether this call is the single HalfOpen trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub provider: String,
    pub status: &'static str,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Remaining cooldown while open.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    policy: BreakerPolicy,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, policy: BreakerPolicy) -> Self {
        Self {
            provider: provider.into(),
            policy,
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                streak_started: None,
                epoch: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().expect("circuit mutex poisoned").status
    }

    /// Whether a call may go out now. Consumes the HalfOpen trial when granted.
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    fn admit(&self) -> Option<Admission> {
        let mut st = self.state.lock().expect("circuit mutex poisoned");
        let status = st.status;
        let trial = Admission {
            epoch: st.epoch,
            trial: true,
        };
        match status {
            CircuitStatus::Closed => Some(Admission {
                epoch: st.epoch,
                trial: false,
            }),
            CircuitStatus::Open { opened_at } => {
                if opened_at.elapsed() >= self.policy.cooldown {
                    self.transition(&mut st, CircuitStatus::HalfOpen { trial_taken: true });
                    Some(trial)
                } else {
                    None
                }
            }
            CircuitStatus::HalfOpen { trial_taken: true } => None,
            CircuitStatus::HalfOpen { trial_taken: false } => {
                st.status = CircuitStatus::HalfOpen { trial_taken: true };
                Some(trial)
            }
        }
    }

    /// [`allow`](Self::allow) as a `Result`, carrying the remaining cooldown.
    pub fn check(&self) -> Result<Admission, IngestError> {
        self.admit().ok_or_else(|| self.open_error())
    }

    /// Like [`check`](Self::check) but never consumes the trial. Lets callers
    /// fail fast before queueing for a rate-limit slot.
    pub fn peek(&self) -> Result<(), IngestError> {
        let refusing = match self.status() {
            CircuitStatus::Closed => false,
            CircuitStatus::Open { opened_at } => opened_at.elapsed() < self.policy.cooldown,
            CircuitStatus::HalfOpen { trial_taken } => trial_taken,
        };
        if refusing {
            Err(self.open_error())
        } else {
            Ok(())
        }
    }

    fn open_error(&self) -> IngestError {
        IngestError::CircuitOpen {
            provider: self.provider.clone(),
            retry_in: self.remaining_cooldown(),
        }
    }

    /// Record the outcome of a call admitted by [`check`](Self::check).
    ///
    /// Only the trial's outcome moves a HalfOpen circuit; late answers from
    /// calls admitted before the last trip are ignored.
    pub fn record_admitted(&self, admission: Admission, outcome: Outcome) {
        let mut st = self.state.lock().expect("circuit mutex poisoned");
        let half_open = matches!(st.status, CircuitStatus::HalfOpen { .. });
        if admission.epoch != st.epoch || admission.trial != half_open {
            tracing::debug!(
                target: "ingest",
                provider = %self.provider,
                outcome = ?outcome,
                "ignoring outcome of a call admitted before the last transition"
            );
            return;
        }
        self.apply(&mut st, outcome);
    }

    /// Record an outcome without an admission (the caller did not gate on
    /// this breaker).
    pub fn record(&self, outcome: Outcome) {
        let mut st = self.state.lock().expect("circuit mutex poisoned");
        self.apply(&mut st, outcome);
    }

    fn apply(&self, st: &mut CircuitState, outcome: Outcome) {
        let status = st.status;
        match outcome {
            Outcome::Success | Outcome::Fatal => match status {
                CircuitStatus::Closed => {
                    st.consecutive_failures = 0;
                    st.streak_started = None;
                }
                CircuitStatus::HalfOpen { .. } => {
                    st.consecutive_failures = 0;
                    st.streak_started = None;
                    self.transition(st, CircuitStatus::Closed);
                }
                // Late answer from a call admitted before the trip.
                CircuitStatus::Open { .. } => {}
            },
            Outcome::Failure => {
                let now = Instant::now();
                match status {
                    CircuitStatus::Closed => {
                        let stale = st
                            .streak_started
                            .map_or(true, |t| now.duration_since(t) > self.policy.evaluation_window);
                        if stale {
                            st.consecutive_failures = 0;
                            st.streak_started = Some(now);
                        }
                        st.consecutive_failures += 1;
                        if st.consecutive_failures >= self.policy.failure_threshold {
                            self.transition(st, CircuitStatus::Open { opened_at: now });
                        }
                    }
                    CircuitStatus::HalfOpen { .. } => {
                        self.transition(st, CircuitStatus::Open { opened_at: now });
                    }
                    CircuitStatus::Open { .. } => {}
                }
            }
            Outcome::Abandoned => {
                if let CircuitStatus::HalfOpen { trial_taken: true } = status {
                    st.status = CircuitStatus::HalfOpen { trial_taken: false };
                }
            }
        }
    }

    /// Open immediately (e.g. the provider revoked our key).
    pub fn trip(&self) {
        let mut st = self.state.lock().expect("circuit mutex poisoned");
        self.transition(&mut st, CircuitStatus::Open { opened_at: Instant::now() });
    }

    pub fn reset(&self) {
        let mut st = self.state.lock().expect("circuit mutex poisoned");
        st.consecutive_failures = 0;
        st.streak_started = None;
        st.epoch += 1;
        self.transition(&mut st, CircuitStatus::Closed);
    }

    /// Remaining cooldown time (zero unless open).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.status() {
            CircuitStatus::Open { opened_at } => self.policy.cooldown.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let st = self.state.lock().expect("circuit mutex poisoned");
        let retry_in_ms = match st.status {
            CircuitStatus::Open { opened_at } => Some(
                self.policy
                    .cooldown
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitSnapshot {
            provider: self.provider.clone(),
            status: st.status.as_str(),
            consecutive_failures: st.consecutive_failures,
            failure_threshold: self.policy.failure_threshold,
            retry_in_ms,
        }
    }

    fn transition(&self, st: &mut CircuitState, to: CircuitStatus) {
        let from = st.status;
        st.status = to;
        if matches!(to, CircuitStatus::Open { .. }) {
            st.epoch += 1;
        }
        if from.as_str() == to.as_str() && !matches!(to, CircuitStatus::Open { .. }) {
            return;
        }
        counter!(
            "circuit_transitions_total",
            "provider" => self.provider.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            CircuitStatus::Open { .. } => tracing::warn!(
                target: "ingest",
                provider = %self.provider,
                from = from.as_str(),
                failures = st.consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(
                target: "ingest",
                provider = %self.provider,
                from = from.as_str(),
                to = to.as_str(),
                "circuit transition"
            ),
        }
    }
}

/// One breaker per provider, shared with that provider's connector.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: &str, policy: BreakerPolicy) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(provider, policy));
        self.breakers
            .write()
            .expect("breaker registry poisoned")
            .insert(provider.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .expect("breaker registry poisoned")
            .get(provider)
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self
            .breakers
            .read()
            .expect("breaker registry poisoned")
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    pub fn reset(&self, provider: &str) -> bool {
        match self.get(provider) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}
