//! Per-provider call budgets.
//!
//! Each provider gets its own [`ProviderLimiter`] with a short sliding window
//! (N calls / W) and an optional daily quota (M calls / 24h). Callers suspend
//! until the short window has room; an exhausted daily quota fails fast.
//!
//! Acquires for one provider take turns (FIFO) on an async turn lock that is
//! held across the wait. The call log itself sits behind a short-lived lock,
//! so refunds, resets and snapshots never queue behind a waiting acquirer.
//! Other providers are unaffected. The registry map is only locked for lookups.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::config::{AdaptiveConfig, ProviderConfig};
use crate::error::IngestError;

const DAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub short_window_calls: u32,
    pub short_window: Duration,
    pub daily_calls: Option<u32>,
    pub daily_window: Duration,
    pub adaptive: AdaptiveConfig,
}

impl RateLimitPolicy {
    pub fn new(calls: u32, window: Duration) -> Self {
        Self {
            short_window_calls: calls.max(1),
            short_window: window,
            daily_calls: None,
            daily_window: DAY,
            adaptive: AdaptiveConfig::default(),
        }
    }

    pub fn with_daily(mut self, calls: u32) -> Self {
        self.daily_calls = Some(calls);
        self
    }
}

impl From<&ProviderConfig> for RateLimitPolicy {
    fn from(cfg: &ProviderConfig) -> Self {
        Self {
            short_window_calls: cfg.short_window_calls.max(1),
            short_window: cfg.short_window(),
            daily_calls: cfg.daily_calls,
            daily_window: DAY,
            adaptive: cfg.adaptive.clone(),
        }
    }
}

/// Call accounting for one provider.
#[derive(Debug)]
struct RateLimitState {
    /// Instants of calls still inside the (effective) short window, oldest first.
    calls: VecDeque<Instant>,
    daily_count: u32,
    daily_window_start: Instant,
}

impl RateLimitState {
    fn new(now: Instant) -> Self {
        Self {
            calls: VecDeque::new(),
            daily_count: 0,
            daily_window_start: now,
        }
    }

    fn roll_daily(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.daily_window_start) >= window {
            self.daily_window_start = now;
            self.daily_count = 0;
        }
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(&t) = self.calls.front() {
            if now.duration_since(t) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Adaptive widening state. Kept apart from the call log so that reporting
/// an outcome never contends with accounting.
#[derive(Debug)]
struct AdaptiveState {
    factor: f64,
    consecutive_successes: u32,
}

/// Proof of a granted call slot; hand it back with [`ProviderLimiter::refund`]
/// if the call is not made after all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub provider: String,
    pub calls_in_window: usize,
    /// Age of the oldest call still counted in the short window.
    pub window_start_age_ms: Option<u64>,
    pub short_window_calls: u32,
    pub effective_window_ms: u64,
    pub penalty_factor: f64,
    pub daily_count: u32,
    pub daily_calls: Option<u32>,
}

#[derive(Debug)]
pub struct ProviderLimiter {
    provider: String,
    policy: RateLimitPolicy,
    /// Held by one acquirer at a time, across its wait.
    turn: Mutex<()>,
    /// Only ever locked briefly; never held across an await.
    state: std::sync::Mutex<RateLimitState>,
    /// Wakes the waiting acquirer when a refund or reset frees a slot.
    freed: Notify,
    adaptive: std::sync::Mutex<AdaptiveState>,
}

impl ProviderLimiter {
    pub fn new(provider: impl Into<String>, policy: RateLimitPolicy) -> Self {
        Self {
            provider: provider.into(),
            policy,
            turn: Mutex::new(()),
            state: std::sync::Mutex::new(RateLimitState::new(Instant::now())),
            freed: Notify::new(),
            adaptive: std::sync::Mutex::new(AdaptiveState {
                factor: 1.0,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Short window widened by the current adaptive penalty.
    pub fn effective_window(&self) -> Duration {
        let factor = self.adaptive.lock().expect("adaptive mutex poisoned").factor;
        self.policy.short_window.mul_f64(factor)
    }

    /// Wait until a call is permitted, then record it.
    ///
    /// Fails fast with `QuotaExceeded` once the daily quota is used up.
    pub async fn acquire(&self) -> Result<Ticket, IngestError> {
        let _turn = self.turn.lock().await;
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut st = self.state.lock().expect("limiter mutex poisoned");
                let now = Instant::now();
                st.roll_daily(now, self.policy.daily_window);
                if let Some(limit) = self.policy.daily_calls {
                    if st.daily_count >= limit {
                        counter!("ratelimit_quota_exceeded_total", "provider" => self.provider.clone())
                            .increment(1);
                        tracing::warn!(
                            target: "ingest",
                            provider = %self.provider,
                            limit,
                            "daily quota exhausted"
                        );
                        return Err(IngestError::QuotaExceeded {
                            provider: self.provider.clone(),
                            limit,
                        });
                    }
                }

                let window = self.effective_window();
                st.evict(now, window);
                if (st.calls.len() as u32) < self.policy.short_window_calls {
                    st.calls.push_back(now);
                    st.daily_count += 1;
                    if !waited.is_zero() {
                        histogram!("ratelimit_wait_ms", "provider" => self.provider.clone())
                            .record(waited.as_secs_f64() * 1_000.0);
                    }
                    return Ok(Ticket { at: now });
                }

                // Window full: wait until the oldest counted call ages out.
                st.calls
                    .front()
                    .map(|oldest| (*oldest + window).saturating_duration_since(now))
                    .unwrap_or_default()
            };
            tracing::debug!(
                target: "ingest",
                provider = %self.provider,
                wait_ms = wait.as_millis() as u64,
                "short window exhausted, waiting"
            );
            let from = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.freed.notified() => {}
            }
            waited += from.elapsed();
        }
    }

    /// Return a granted slot whose call was never made.
    ///
    /// The daily quota is credited back even when the slot already aged out
    /// of the short window, unless the daily window rolled over since.
    pub fn refund(&self, ticket: Ticket) {
        {
            let mut st = self.state.lock().expect("limiter mutex poisoned");
            if let Some(pos) = st.calls.iter().rposition(|t| *t == ticket.at) {
                st.calls.remove(pos);
            }
            if ticket.at >= st.daily_window_start {
                st.daily_count = st.daily_count.saturating_sub(1);
            }
        }
        self.freed.notify_one();
    }

    /// The provider answered 429 although local accounting had budget left.
    pub fn on_rate_limited(&self) {
        let cfg = &self.policy.adaptive;
        if !cfg.enabled {
            return;
        }
        let mut a = self.adaptive.lock().expect("adaptive mutex poisoned");
        a.factor = (a.factor * cfg.multiplier).min(cfg.max_factor).max(1.0);
        a.consecutive_successes = 0;
        tracing::warn!(
            target: "ingest",
            provider = %self.provider,
            factor = a.factor,
            "provider rate-limit signal, widening window"
        );
    }

    /// Successful call. Enough of these in a row step the penalty back down.
    pub fn on_success(&self) {
        let cfg = &self.policy.adaptive;
        let mut a = self.adaptive.lock().expect("adaptive mutex poisoned");
        if a.factor <= 1.0 {
            return;
        }
        a.consecutive_successes += 1;
        if a.consecutive_successes >= cfg.restore_after_successes.max(1) {
            let step = (cfg.multiplier - 1.0).max(f64::EPSILON);
            a.factor = (a.factor - step).max(1.0);
            a.consecutive_successes = 0;
            tracing::info!(
                target: "ingest",
                provider = %self.provider,
                factor = a.factor,
                "rate-limit penalty reduced"
            );
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let st = self.state.lock().expect("limiter mutex poisoned");
        let now = Instant::now();
        let factor = self.adaptive.lock().expect("adaptive mutex poisoned").factor;
        RateLimitSnapshot {
            provider: self.provider.clone(),
            calls_in_window: st.calls.len(),
            window_start_age_ms: st
                .calls
                .front()
                .map(|t| now.duration_since(*t).as_millis() as u64),
            short_window_calls: self.policy.short_window_calls,
            effective_window_ms: self.policy.short_window.mul_f64(factor).as_millis() as u64,
            penalty_factor: factor,
            daily_count: st.daily_count,
            daily_calls: self.policy.daily_calls,
        }
    }

    /// Administrative reset: forget all accounting and penalties.
    pub fn reset(&self) {
        {
            let mut st = self.state.lock().expect("limiter mutex poisoned");
            *st = RateLimitState::new(Instant::now());
            let mut a = self.adaptive.lock().expect("adaptive mutex poisoned");
            a.factor = 1.0;
            a.consecutive_successes = 0;
        }
        self.freed.notify_one();
    }
}

/// Owns one limiter per provider. Passed to connectors; never a global.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<ProviderLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider's policy and return its limiter.
    pub fn register(&self, provider: &str, policy: RateLimitPolicy) -> Arc<ProviderLimiter> {
        let limiter = Arc::new(ProviderLimiter::new(provider, policy));
        self.limiters
            .write()
            .expect("limiter registry poisoned")
            .insert(provider.to_string(), limiter.clone());
        limiter
    }

    pub fn get(&self, provider: &str) -> Option<Arc<ProviderLimiter>> {
        self.limiters
            .read()
            .expect("limiter registry poisoned")
            .get(provider)
            .cloned()
    }

    pub async fn acquire(&self, provider: &str) -> Result<Ticket, IngestError> {
        let limiter = self
            .get(provider)
            .ok_or_else(|| IngestError::Config(format!("no rate limiter for provider {provider}")))?;
        limiter.acquire().await
    }

    pub fn snapshots(&self) -> Vec<RateLimitSnapshot> {
        let limiters: Vec<_> = self
            .limiters
            .read()
            .expect("limiter registry poisoned")
            .values()
            .cloned()
            .collect();
        let mut out: Vec<_> = limiters.iter().map(|l| l.snapshot()).collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    pub fn reset(&self, provider: &str) -> bool {
        match self.get(provider) {
            Some(l) => {
                l.reset();
                true
            }
            None => false,
        }
    }
}
