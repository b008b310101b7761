// src/ingest/connector.rs
//! One connector per provider: rate limit → circuit gate → retried raw call →
//! status classification → validation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::Semaphore;

use crate::error::{FinalError, IngestError, ValidationError};
use crate::ingest::types::{FetchRequest, RawResponse, ValidatedRecord};
use crate::ingest::validate::ResponseValidator;
use crate::limits::{CircuitBreaker, ProviderLimiter, RetryExecutor};

/// The raw network call. Returns any HTTP status as a [`RawResponse`]; only
/// transport failures are errors. No retry or rate-limit logic lives here.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> Result<RawResponse, IngestError>;
}

/// Result of one successful logical fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Raw body, kept for the read-through cache.
    pub body: String,
    pub records: Vec<ValidatedRecord>,
    pub rejected: Vec<ValidationError>,
    /// Network calls actually issued (attempts that reached the client).
    pub calls: u32,
}

#[derive(Debug)]
pub struct FetchFailure {
    pub error: FinalError,
    pub calls: u32,
}

impl FetchFailure {
    fn refused(error: IngestError) -> Self {
        Self {
            error: FinalError {
                error,
                attempts: 0,
                exhausted: false,
            },
            calls: 0,
        }
    }
}

pub struct SourceConnector {
    provider: String,
    client: Arc<dyn ProviderClient>,
    limiter: Arc<ProviderLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    validator: ResponseValidator,
    in_flight: Semaphore,
    call_timeout: Duration,
}

impl SourceConnector {
    pub fn new(
        provider: impl Into<String>,
        client: Arc<dyn ProviderClient>,
        limiter: Arc<ProviderLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryExecutor,
        validator: ResponseValidator,
    ) -> Self {
        Self {
            provider: provider.into(),
            client,
            limiter,
            retry: retry.with_breaker(breaker.clone()),
            breaker,
            validator,
            in_flight: Semaphore::new(1),
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Bound on concurrent logical fetches against this provider.
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.in_flight = Semaphore::new(n.max(1));
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn fetch(
        &self,
        entity: &str,
        data_type: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<FetchOutcome, FetchFailure> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchFailure::refused(IngestError::Config("connector closed".into())))?;

        // Fail fast while open; the gate is checked again once a slot is held.
        self.breaker.peek().map_err(|e| {
            self.count_error(&e);
            FetchFailure::refused(e)
        })?;
        let ticket = self.limiter.acquire().await.map_err(|e| {
            self.count_error(&e);
            FetchFailure::refused(e)
        })?;
        let admission = match self.breaker.check() {
            Ok(admission) => admission,
            Err(e) => {
                self.limiter.refund(ticket);
                self.count_error(&e);
                return Err(FetchFailure::refused(e));
            }
        };

        let calls = AtomicU32::new(0);
        let raw = self
            .retry
            .run_admitted(admission, |attempt| {
                self.attempt(attempt, entity, data_type, params, &calls)
            })
            .await;
        let calls = calls.load(Ordering::SeqCst);
        let raw = raw.map_err(|error| FetchFailure { error, calls })?;

        let batch = self.validator.validate_batch(data_type, &raw).map_err(|e| {
            let error = IngestError::from(e);
            self.count_error(&error);
            tracing::warn!(
                target: "ingest",
                provider = %self.provider,
                entity,
                data_type,
                error = %error,
                "payload rejected"
            );
            FetchFailure {
                error: FinalError {
                    error,
                    attempts: calls,
                    exhausted: false,
                },
                calls,
            }
        })?;

        let mut records = Vec::with_capacity(batch.len());
        let mut rejected = Vec::new();
        for item in batch {
            match item {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    tracing::warn!(
                        target: "ingest",
                        provider = %self.provider,
                        entity,
                        data_type,
                        error = %e,
                        "record rejected"
                    );
                    counter!("ingest_validation_rejected_total", "provider" => self.provider.clone())
                        .increment(1);
                    rejected.push(e);
                }
            }
        }

        Ok(FetchOutcome {
            body: raw.body,
            records,
            rejected,
            calls,
        })
    }

    async fn attempt(
        &self,
        attempt: u32,
        entity: &str,
        data_type: &str,
        params: &BTreeMap<String, String>,
        calls: &AtomicU32,
    ) -> Result<RawResponse, IngestError> {
        // Attempt 1 runs on the slot acquired up front.
        if attempt > 1 {
            self.limiter.acquire().await?;
        }

        let mut req = FetchRequest::new(&self.provider, entity, data_type);
        req.params = params.clone();

        calls.fetch_add(1, Ordering::SeqCst);
        counter!("ingest_calls_total", "provider" => self.provider.clone()).increment(1);
        tracing::debug!(target: "ingest", provider = %self.provider, entity, data_type, attempt, "calling provider");

        let res = match tokio::time::timeout(self.call_timeout, self.client.fetch(&req)).await {
            Ok(res) => res,
            Err(_) => Err(IngestError::Network(format!(
                "request timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        };
        let classified = res.and_then(|raw| self.classify(raw));
        match &classified {
            Ok(_) => self.limiter.on_success(),
            Err(e) => self.count_error(e),
        }
        classified
    }

    /// Map HTTP status to the error taxonomy.
    fn classify(&self, raw: RawResponse) -> Result<RawResponse, IngestError> {
        match raw.status_code {
            200..=299 => Ok(raw),
            429 => {
                self.limiter.on_rate_limited();
                Err(IngestError::RateLimited {
                    provider: self.provider.clone(),
                    retry_after: raw.retry_after_secs.map(Duration::from_secs),
                })
            }
            s @ 500..=599 => Err(IngestError::Server {
                provider: self.provider.clone(),
                status: s,
            }),
            s => Err(IngestError::Client {
                provider: self.provider.clone(),
                status: s,
                message: raw.body.chars().take(200).collect(),
            }),
        }
    }

    fn count_error(&self, e: &IngestError) {
        counter!(
            "ingest_errors_total",
            "provider" => self.provider.clone(),
            "kind" => e.kind().as_str()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::validate::SchemaRegistry;
    use crate::limits::{BackoffPolicy, BreakerPolicy, RateLimitPolicy};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<RawResponse, IngestError>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        async fn fetch(&self, req: &FetchRequest) -> Result<RawResponse, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(RawResponse::ok(&req.provider_id, "[]"));
            }
            replies.remove(0)
        }
    }

    fn connector(replies: Vec<Result<RawResponse, IngestError>>) -> (SourceConnector, Arc<Scripted>) {
        let client = Arc::new(Scripted {
            replies: Mutex::new(replies),
            calls: AtomicU32::new(0),
        });
        let limiter = Arc::new(ProviderLimiter::new(
            "av",
            RateLimitPolicy::new(100, Duration::from_secs(1)),
        ));
        let breaker = Arc::new(CircuitBreaker::new("av", BreakerPolicy::default()));
        let retry = RetryExecutor::new(
            "av",
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 3),
        );
        let validator = ResponseValidator::new(
            Arc::new(SchemaRegistry::builtin()),
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            0.6,
        );
        let c = SourceConnector::new("av", client.clone(), limiter, breaker, retry, validator);
        (c, client)
    }

    const QUOTE: &str = r#"{"symbol": "IBM", "date": "2024-05-31", "close": 171.5}"#;

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_then_validates() {
        let (c, client) = connector(vec![
            Ok(RawResponse::with_status("av", 503, "busy")),
            Ok(RawResponse::ok("av", QUOTE)),
        ]);
        let out = c.fetch("IBM", "quote", &BTreeMap::new()).await.unwrap();
        assert_eq!(out.calls, 2);
        assert_eq!(out.records.len(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let (c, client) = connector(vec![Ok(RawResponse::with_status("av", 404, "no such symbol"))]);
        let err = c.fetch("NOPE", "quote", &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.calls, 1);
        match err.error.error {
            IngestError::Client { status, ref message, .. } => {
                assert_eq!(status, 404);
                assert_eq!(message, "no such symbol");
            }
            ref other => panic!("expected client error, got {other:?}"),
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_response_widens_the_limiter() {
        let (c, _) = connector(vec![
            Ok(RawResponse::with_status("av", 429, "slow down")),
            Ok(RawResponse::ok("av", QUOTE)),
        ]);
        c.fetch("IBM", "quote", &BTreeMap::new()).await.unwrap();
        assert_eq!(c.limiter.effective_window(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_as_network_errors() {
        struct Hang;
        #[async_trait]
        impl ProviderClient for Hang {
            async fn fetch(&self, _: &FetchRequest) -> Result<RawResponse, IngestError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(IngestError::Network("unreachable".into()))
            }
        }
        let (c, _) = connector(vec![]);
        let c = SourceConnector {
            client: Arc::new(Hang),
            ..c
        }
        .with_call_timeout(Duration::from_secs(5));
        let err = c.fetch("IBM", "quote", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err.error.error, IngestError::Network(_)));
        assert_eq!(err.calls, 3);
        assert!(err.error.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_a_slot() {
        let (c, client) = connector(vec![]);
        c.breaker.trip();
        let t0 = tokio::time::Instant::now();
        let err = c.fetch("IBM", "quote", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err.error.error, IngestError::CircuitOpen { .. }));
        assert_eq!(err.calls, 0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.limiter.snapshot().daily_count, 0);
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_keeps_valid_records_and_counts_rejects() {
        let body = r#"[
            {"symbol": "IBM", "date": "2024-05-30", "close": 170.0},
            {"symbol": "IBM", "date": "2024-05-31", "close": -3}
        ]"#;
        let (c, _) = connector(vec![Ok(RawResponse::ok("av", body))]);
        let out = c.fetch("IBM", "quote", &BTreeMap::new()).await.unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.rejected.len(), 1);
    }
}
