// tests/orchestrator_run.rs
//
// Whole-run behaviour: cache reuse across runs, per-entity failure isolation,
// quota deferrals and cancellation.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{entities, quote_body, CountingClient};
use market_ingest::config::ProviderConfig;
use market_ingest::error::{ErrorKind, IngestError};
use market_ingest::history::RunHistory;
use market_ingest::ingest::orchestrator::{IngestionOrchestrator, RunPhase, RunStatus};
use market_ingest::ingest::store::{MemoryStore, RecordDraft, RecordStore, Upserted};
use market_ingest::ingest::types::{PersistedRecord, RawResponse, RecordKey};
use tokio_util::sync::CancellationToken;

fn quotes_provider() -> ProviderConfig {
    let mut cfg = ProviderConfig::with_quota(100, 1);
    cfg.data_types = vec!["quote".into()];
    cfg
}

#[tokio::test(start_paused = true)]
async fn cached_fetch_skips_the_network_until_ttl_expires() {
    let client = Arc::new(CountingClient::quotes(171.5));
    let mut cfg = quotes_provider();
    cfg.cache_ttl_seconds_by_data_type.insert("quote".into(), 60);
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .provider("alphavantage", &cfg, client.clone())
        .build();
    let cancel = CancellationToken::new();
    let work = entities(&["IBM"]);

    let first = orch.run(&work, &cancel).await.unwrap();
    assert_eq!(first.per_provider_calls.get("alphavantage"), Some(&1));

    tokio::time::advance(Duration::from_secs(30)).await;
    let second = orch.run(&work, &cancel).await.unwrap();
    assert_eq!(second.records.cache_hits, 1);
    assert_eq!(second.per_provider_calls.get("alphavantage"), Some(&0));
    assert_eq!(client.calls(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let third = orch.run(&work, &cancel).await.unwrap();
    assert_eq!(third.records.cache_hits, 0);
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn uncached_data_types_always_fetch() {
    let client = Arc::new(CountingClient::quotes(171.5));
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .provider("alphavantage", &quotes_provider(), client.clone())
        .build();
    let cancel = CancellationToken::new();
    orch.run(&entities(&["IBM"]), &cancel).await.unwrap();
    orch.run(&entities(&["IBM"]), &cancel).await.unwrap();
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn one_failing_entity_does_not_stop_the_batch() {
    let client = Arc::new(CountingClient::new(|req| {
        if req.entity_key == "BOGUS" {
            Ok(RawResponse::with_status(&req.provider_id, 404, "unknown symbol"))
        } else {
            Ok(RawResponse::ok(&req.provider_id, quote_body(&req.entity_key, 99.0)))
        }
    }));
    let history = Arc::new(RunHistory::with_capacity(5));
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .provider("alphavantage", &quotes_provider(), client)
        .sink(history.clone())
        .build();

    let report = orch
        .run(&entities(&["AAPL", "BOGUS", "MSFT"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.total_entities, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].entity, "BOGUS");
    assert_eq!(report.failures[0].kind, ErrorKind::Client);
    assert_eq!(report.per_provider_errors.get("alphavantage"), Some(&1));
    assert_eq!(report.records.inserted, 2);

    assert_eq!(history.last().map(|r| r.run_id), Some(report.run_id));
    assert_eq!(orch.phase(), RunPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn exhausted_daily_quota_defers_remaining_entities() {
    let client = Arc::new(CountingClient::quotes(50.0));
    let mut cfg = quotes_provider();
    cfg.daily_calls = Some(2);
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .workers(1)
        .provider("alphavantage", &cfg, client.clone())
        .build();

    let report = orch
        .run(&entities(&["A", "B", "C", "D"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.deferred, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    let deferred: Vec<&str> = report.deferrals.iter().map(|d| d.entity.as_str()).collect();
    assert_eq!(deferred, vec!["C", "D"]);
    assert!(report.deferrals.iter().all(|d| d.kind == ErrorKind::QuotaExceeded));
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn cancelled_run_reports_unstarted_entities() {
    let client = Arc::new(CountingClient::quotes(10.0));
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .provider("alphavantage", &quotes_provider(), client.clone())
        .build();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orch.run(&entities(&["A", "B"]), &cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.not_started, 2);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn reset_provider_clears_limiter_and_breaker() {
    let client = Arc::new(CountingClient::quotes(10.0));
    let orch = IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
        .provider("alphavantage", &quotes_provider(), client)
        .build();

    orch.run(&entities(&["A"]), &CancellationToken::new()).await.unwrap();
    orch.breakers().get("alphavantage").unwrap().trip();

    assert!(orch.reset_provider("alphavantage"));
    assert!(!orch.reset_provider("unknown"));
    let snap = orch.limiters().get("alphavantage").unwrap().snapshot();
    assert_eq!(snap.daily_count, 0);
    assert_eq!(orch.breakers().get("alphavantage").unwrap().snapshot().status, "closed");
}

/// Accepts the first `ok` upserts, then fails every write.
struct FailingAfter {
    inner: MemoryStore,
    ok: u32,
    upserts: AtomicU32,
}

#[async_trait]
impl RecordStore for FailingAfter {
    async fn get(&self, key: &RecordKey) -> Result<Option<PersistedRecord>, IngestError> {
        self.inner.get(key).await
    }

    async fn find_by_content_hash(
        &self,
        data_type: &str,
        content_hash: &str,
    ) -> Result<Option<PersistedRecord>, IngestError> {
        self.inner.find_by_content_hash(data_type, content_hash).await
    }

    async fn upsert(
        &self,
        draft: &RecordDraft,
        expected_hash: Option<&str>,
    ) -> Result<Upserted, IngestError> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) >= self.ok {
            return Err(IngestError::Storage("disk full".into()));
        }
        self.inner.upsert(draft, expected_hash).await
    }

    async fn count(&self) -> Result<usize, IngestError> {
        self.inner.count().await
    }
}

#[tokio::test(start_paused = true)]
async fn rows_written_before_a_storage_failure_are_reported() {
    let store = Arc::new(FailingAfter {
        inner: MemoryStore::new(),
        ok: 1,
        upserts: AtomicU32::new(0),
    });
    let client = Arc::new(CountingClient::new(|req| {
        let body = format!(
            r#"[{{"symbol": "{s}", "date": "2024-05-30", "close": 170.0}},
                {{"symbol": "{s}", "date": "2024-05-31", "close": 171.5}}]"#,
            s = req.entity_key
        );
        Ok(RawResponse::ok(&req.provider_id, body))
    }));
    let orch = IngestionOrchestrator::builder(store.clone())
        .provider("alphavantage", &quotes_provider(), client)
        .build();

    let report = orch
        .run(&entities(&["IBM"]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.records.fetched, 2);
    assert_eq!(report.records.inserted, 1);
    assert_eq!(report.failures[0].kind, ErrorKind::Storage);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_can_be_spawned_onto_a_multi_thread_runtime() {
    let client = Arc::new(CountingClient::quotes(99.0));
    let orch = Arc::new(
        IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
            .provider("alphavantage", &quotes_provider(), client.clone())
            .workers(2)
            .build(),
    );
    let cancel = CancellationToken::new();

    let task = {
        let orch = orch.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orch.run(&entities(&["IBM", "MSFT", "AAPL"]), &cancel).await })
    };
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.records.inserted, 3);
    assert_eq!(client.calls(), 3);
}
