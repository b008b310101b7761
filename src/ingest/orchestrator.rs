// src/ingest/orchestrator.rs
//! Runs every configured provider/data-type job for a list of entities and
//! folds the outcomes into a [`RunReport`].
//!
//! Failures stop at the job boundary: a fatal error marks that entity failed,
//! a daily-quota refusal marks it deferred, and the batch always continues.
//! Cancellation is checked before each entity starts, never mid-attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{gauge, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{IngestConfig, ProviderConfig};
use crate::error::{ErrorKind, FinalError, IngestError};
use crate::ingest::cache::{CacheLayer, CacheLookup};
use crate::ingest::connector::{FetchFailure, ProviderClient, SourceConnector};
use crate::ingest::dedup::Deduplicator;
use crate::ingest::ensure_metrics_described;
use crate::ingest::store::{RecordStore, UpsertRepository, WriteAction};
use crate::ingest::types::FetchRequest;
use crate::ingest::validate::{ResponseValidator, SchemaRegistry};
use crate::limits::{
    BackoffPolicy, BreakerPolicy, CircuitBreakerRegistry, RateLimitPolicy, RateLimiterRegistry,
    RetryExecutor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// At least one entity failed, was deferred, or never started.
    PartiallyFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub fetched: u64,
    pub validated: u64,
    pub rejected: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub cache_hits: u64,
}

impl RecordCounts {
    fn absorb(&mut self, o: &RecordCounts) {
        self.fetched += o.fetched;
        self.validated += o.validated;
        self.rejected += o.rejected;
        self.inserted += o.inserted;
        self.updated += o.updated;
        self.skipped += o.skipped;
        self.cache_hits += o.cache_hits;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub entity: String,
    pub provider: String,
    pub data_type: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: u64,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub total_entities: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub not_started: usize,
    pub per_provider_calls: BTreeMap<String, u64>,
    pub per_provider_errors: BTreeMap<String, u64>,
    pub records: RecordCounts,
    /// Fatal job failures, by entity then provider.
    pub failures: Vec<JobFailure>,
    /// Jobs refused by an exhausted daily quota; re-run these later.
    pub deferrals: Vec<JobFailure>,
    pub duration_ms: u64,
}

/// Observability collaborator that receives each finished run.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &RunReport);
}

/// Default sink: one structured log line plus run metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&self, r: &RunReport) {
        histogram!("ingest_run_duration_ms").record(r.duration_ms as f64);
        gauge!("ingest_pipeline_last_run_ts").set(r.started_at.timestamp() as f64);
        tracing::info!(
            target: "ingest",
            run_id = r.run_id,
            status = ?r.status,
            cancelled = r.cancelled,
            total = r.total_entities,
            succeeded = r.succeeded,
            failed = r.failed,
            deferred = r.deferred,
            not_started = r.not_started,
            inserted = r.records.inserted,
            updated = r.records.updated,
            skipped = r.records.skipped,
            cache_hits = r.records.cache_hits,
            duration_ms = r.duration_ms,
            "ingestion run finished"
        );
    }
}

struct ProviderPipeline {
    connector: Arc<SourceConnector>,
    data_types: Vec<String>,
    cache_ttls: HashMap<String, Duration>,
}

#[derive(Debug)]
enum JobResult {
    Done(RecordCounts),
    /// `written` holds what was stored before the failure.
    Failed {
        error: FinalError,
        written: RecordCounts,
    },
}

/// A failed load, with whatever the job stored before it failed.
struct JobFailed {
    error: FinalError,
    calls: u32,
    written: RecordCounts,
}

impl JobFailed {
    fn new(error: IngestError, calls: u32, written: RecordCounts) -> Self {
        Self {
            error: FinalError {
                error,
                attempts: calls,
                exhausted: false,
            },
            calls,
            written,
        }
    }
}

impl From<FetchFailure> for JobFailed {
    fn from(f: FetchFailure) -> Self {
        Self {
            error: f.error,
            calls: f.calls,
            written: RecordCounts::default(),
        }
    }
}

#[derive(Debug)]
struct JobReport {
    provider: String,
    data_type: String,
    calls: u32,
    result: JobResult,
}

#[derive(Debug)]
struct EntityOutcome {
    entity: String,
    started: bool,
    jobs: Vec<JobReport>,
}

pub struct IngestionOrchestrator {
    providers: Vec<ProviderPipeline>,
    cache: CacheLayer,
    dedup: Deduplicator,
    repo: UpsertRepository,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    sinks: Vec<Arc<dyn ReportSink>>,
    workers: usize,
    running: AtomicBool,
    next_run: AtomicU64,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IngestionOrchestrator {
    pub fn builder(store: Arc<dyn RecordStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    pub fn phase(&self) -> RunPhase {
        if self.running.load(Ordering::SeqCst) {
            RunPhase::Running
        } else {
            RunPhase::Idle
        }
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.connector.provider().to_string())
            .collect()
    }

    /// Administrative reset of one provider's limiter and breaker.
    pub fn reset_provider(&self, provider: &str) -> bool {
        let limiter = self.limiters.reset(provider);
        let breaker = self.breakers.reset(provider);
        if limiter || breaker {
            tracing::info!(target: "ingest", provider, "provider state reset");
        }
        limiter || breaker
    }

    /// One ingestion run over `entities`. Refuses to start while another run
    /// is in progress.
    pub async fn run(
        &self,
        entities: &[String],
        cancel: &CancellationToken,
    ) -> Result<RunReport, IngestError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IngestError::Config("an ingestion run is already in progress".into()));
        }
        let _guard = RunningGuard(&self.running);
        ensure_metrics_described();

        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        let t0 = Instant::now();
        tracing::info!(target: "ingest", run_id, entities = entities.len(), "ingestion run started");

        let purged = self.cache.purge_expired().await;
        if purged > 0 {
            tracing::debug!(target: "ingest", run_id, purged, "expired cache entries dropped");
        }

        let outcomes: Vec<EntityOutcome> = stream::iter(entities.iter().cloned())
            .map(|entity: String| async move {
                if cancel.is_cancelled() {
                    return EntityOutcome {
                        entity,
                        started: false,
                        jobs: Vec::new(),
                    };
                }
                self.process_entity(&entity).await
            })
            .buffer_unordered(self.workers.max(1))
            .collect()
            .await;

        let report = assemble(
            run_id,
            started_at,
            outcomes,
            cancel.is_cancelled(),
            t0.elapsed(),
        );
        for sink in &self.sinks {
            sink.emit(&report);
        }
        Ok(report)
    }

    async fn process_entity(&self, entity: &str) -> EntityOutcome {
        let mut jobs = Vec::new();
        for p in &self.providers {
            for data_type in &p.data_types {
                jobs.push(self.run_job(p, entity, data_type).await);
            }
        }
        EntityOutcome {
            entity: entity.to_string(),
            started: true,
            jobs,
        }
    }

    async fn run_job(&self, p: &ProviderPipeline, entity: &str, data_type: &str) -> JobReport {
        let provider = p.connector.provider().to_string();
        let req = FetchRequest::new(&provider, entity, data_type);
        let ttl = p.cache_ttls.get(data_type).copied();

        let lookup = self
            .cache
            .read_through(&req.cache_key(), ttl, || self.load(p, &req))
            .await;

        let (calls, result) = match lookup {
            Ok(CacheLookup::Hit(_)) => (
                0,
                JobResult::Done(RecordCounts {
                    cache_hits: 1,
                    ..Default::default()
                }),
            ),
            Ok(CacheLookup::Miss((counts, calls))) => (calls, JobResult::Done(counts)),
            Err(f) => {
                tracing::warn!(
                    target: "ingest",
                    entity,
                    provider = %provider,
                    data_type,
                    kind = %f.error.kind(),
                    error = %f.error,
                    written = f.written.inserted + f.written.updated,
                    "job failed"
                );
                (
                    f.calls,
                    JobResult::Failed {
                        error: f.error,
                        written: f.written,
                    },
                )
            }
        };
        JobReport {
            provider,
            data_type: data_type.to_string(),
            calls,
            result,
        }
    }

    /// Cache-miss path: fetch, validate, dedup and write. Returns the counts
    /// and the body to cache.
    async fn load(
        &self,
        p: &ProviderPipeline,
        req: &FetchRequest,
    ) -> Result<((RecordCounts, u32), String), JobFailed> {
        let out = p
            .connector
            .fetch(&req.entity_key, &req.data_type, &req.params)
            .await?;
        let calls = out.calls;

        let mut counts = RecordCounts {
            fetched: (out.records.len() + out.rejected.len()) as u64,
            validated: out.records.len() as u64,
            rejected: out.rejected.len() as u64,
            ..Default::default()
        };
        if out.records.is_empty() {
            if let Some(first) = out.rejected.first() {
                return Err(JobFailed::new(first.clone().into(), calls, counts));
            }
        }

        for rec in &out.records {
            let resolution = match self.dedup.resolve(rec).await {
                Ok(r) => r,
                Err(e) => return Err(JobFailed::new(e, calls, counts)),
            };
            let written = match self.repo.write(rec, &resolution).await {
                Ok(w) => w,
                Err(error) => {
                    return Err(JobFailed {
                        error,
                        calls,
                        written: counts,
                    })
                }
            };
            match written.action {
                WriteAction::Inserted => counts.inserted += 1,
                WriteAction::Updated => counts.updated += 1,
                WriteAction::Unchanged | WriteAction::Duplicate => counts.skipped += 1,
            }
        }
        Ok(((counts, calls), out.body))
    }
}

fn assemble(
    run_id: u64,
    started_at: DateTime<Utc>,
    mut outcomes: Vec<EntityOutcome>,
    cancelled: bool,
    elapsed: Duration,
) -> RunReport {
    outcomes.sort_by(|a, b| a.entity.cmp(&b.entity));

    let mut report = RunReport {
        run_id,
        started_at,
        status: RunStatus::Completed,
        cancelled,
        total_entities: outcomes.len(),
        succeeded: 0,
        failed: 0,
        deferred: 0,
        not_started: 0,
        per_provider_calls: BTreeMap::new(),
        per_provider_errors: BTreeMap::new(),
        records: RecordCounts::default(),
        failures: Vec::new(),
        deferrals: Vec::new(),
        duration_ms: elapsed.as_millis() as u64,
    };

    for o in outcomes {
        if !o.started {
            report.not_started += 1;
            continue;
        }
        let mut any_failed = false;
        let mut any_deferred = false;
        for job in o.jobs {
            *report.per_provider_calls.entry(job.provider.clone()).or_default() +=
                u64::from(job.calls);
            match job.result {
                JobResult::Done(c) => report.records.absorb(&c),
                JobResult::Failed { error: e, written } => {
                    report.records.absorb(&written);
                    *report.per_provider_errors.entry(job.provider.clone()).or_default() += 1;
                    let entry = JobFailure {
                        entity: o.entity.clone(),
                        provider: job.provider,
                        data_type: job.data_type,
                        kind: e.kind(),
                        attempts: e.attempts,
                        error: e.to_string(),
                    };
                    if e.kind() == ErrorKind::QuotaExceeded {
                        any_deferred = true;
                        report.deferrals.push(entry);
                    } else {
                        any_failed = true;
                        report.failures.push(entry);
                    }
                }
            }
        }
        if any_failed {
            report.failed += 1;
        } else if any_deferred {
            report.deferred += 1;
        } else {
            report.succeeded += 1;
        }
    }

    if report.failed > 0 || report.deferred > 0 || report.not_started > 0 {
        report.status = RunStatus::PartiallyFailed;
    }
    report
}

/// Wires registries, connectors and storage into an orchestrator.
pub struct OrchestratorBuilder {
    store: Arc<dyn RecordStore>,
    schemas: Arc<SchemaRegistry>,
    cache: CacheLayer,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    providers: Vec<ProviderPipeline>,
    sinks: Vec<Arc<dyn ReportSink>>,
    workers: usize,
    storage_policy: BackoffPolicy,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            schemas: Arc::new(SchemaRegistry::builtin()),
            cache: CacheLayer::in_memory(),
            limiters: Arc::new(RateLimiterRegistry::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            providers: Vec::new(),
            sinks: Vec::new(),
            workers: 4,
            storage_policy: BackoffPolicy::storage(),
        }
    }

    /// Must be set before providers are added; their validators share it.
    pub fn schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn cache(mut self, cache: CacheLayer) -> Self {
        self.cache = cache;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn storage_policy(mut self, policy: BackoffPolicy) -> Self {
        self.storage_policy = policy;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register a provider: its limiter, breaker, retry policy, validator
    /// and connector all derive from `cfg`.
    pub fn provider(mut self, name: &str, cfg: &ProviderConfig, client: Arc<dyn ProviderClient>) -> Self {
        let limiter = self.limiters.register(name, RateLimitPolicy::from(cfg));
        let breaker = self.breakers.register(name, BreakerPolicy::from(cfg));
        let retry = RetryExecutor::new(name, BackoffPolicy::from(cfg));
        let validator = ResponseValidator::for_provider(self.schemas.clone(), cfg);
        let connector = SourceConnector::new(name, client, limiter, breaker, retry, validator)
            .with_max_in_flight(cfg.max_in_flight)
            .with_call_timeout(cfg.call_timeout());

        let data_types: Vec<String> = cfg
            .data_types
            .iter()
            .filter(|dt| {
                let known = self.schemas.get(dt).is_some();
                if !known {
                    tracing::warn!(provider = name, data_type = %dt, "no schema for data type, skipping");
                }
                known
            })
            .cloned()
            .collect();
        let cache_ttls = data_types
            .iter()
            .filter_map(|dt| cfg.cache_ttl(dt).map(|ttl| (dt.clone(), ttl)))
            .collect();

        self.providers.push(ProviderPipeline {
            connector: Arc::new(connector),
            data_types,
            cache_ttls,
        });
        self
    }

    /// Register every provider in `cfg`, asking `client_for` for each raw client.
    pub fn providers_from_config<F>(mut self, cfg: &IngestConfig, mut client_for: F) -> Result<Self, IngestError>
    where
        F: FnMut(&str, &ProviderConfig) -> Result<Arc<dyn ProviderClient>, IngestError>,
    {
        self.workers = cfg.workers.max(1);
        for (name, pcfg) in &cfg.providers {
            let client = client_for(name, pcfg)?;
            self = self.provider(name, pcfg, client);
        }
        Ok(self)
    }

    pub fn build(self) -> IngestionOrchestrator {
        let sinks = if self.sinks.is_empty() {
            vec![Arc::new(LogSink) as Arc<dyn ReportSink>]
        } else {
            self.sinks
        };
        IngestionOrchestrator {
            dedup: Deduplicator::new(self.store.clone(), self.schemas.clone()),
            repo: UpsertRepository::with_policy(self.store, self.storage_policy),
            providers: self.providers,
            cache: self.cache,
            limiters: self.limiters,
            breakers: self.breakers,
            sinks,
            workers: self.workers,
            running: AtomicBool::new(false),
            next_run: AtomicU64::new(0),
        }
    }
}
