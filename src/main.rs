//! market-ingest binary entrypoint.
//! Loads config, starts the scheduled ingestion loop and serves the
//! operational router until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use market_ingest::{
    api::{self, AppState},
    config,
    history::RunHistory,
    ingest::{
        connector::ProviderClient,
        orchestrator::{IngestionOrchestrator, LogSink},
        providers::HttpProviderClient,
        scheduler::{spawn_scheduler, IngestSchedulerCfg},
        store::{MemoryStore, RecordStore},
    },
    metrics::Metrics,
    telemetry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let cfg = config::load_default().context("loading ingest config")?;
    let metrics = Metrics::init()?;

    let history = Arc::new(RunHistory::with_capacity(100));
    let store = build_store().await?;
    let orchestrator = IngestionOrchestrator::builder(store)
        .sink(Arc::new(LogSink))
        .sink(history.clone())
        .providers_from_config(&cfg, |name, pcfg| {
            let client = HttpProviderClient::from_config(name, pcfg)?;
            Ok(Arc::new(client) as Arc<dyn ProviderClient>)
        })?
        .build();
    let orchestrator = Arc::new(orchestrator);
    tracing::info!(
        providers = ?orchestrator.provider_names(),
        entities = cfg.entities.len(),
        interval_secs = cfg.interval_secs,
        "ingestion configured"
    );

    let cancel = CancellationToken::new();
    let scheduler = spawn_scheduler(
        orchestrator.clone(),
        IngestSchedulerCfg {
            interval_secs: cfg.interval_secs,
            entities: cfg.entities.clone(),
        },
        cancel.clone(),
    );

    let app = api::router(
        AppState {
            orchestrator,
            history,
        },
        &metrics,
    );
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("http server")?;

    cancel.cancel();
    if let Err(e) = scheduler.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}

/// Postgres when built with the `postgres` feature and `DATABASE_URL` is set,
/// otherwise the in-process store.
#[cfg(feature = "postgres")]
async fn build_store() -> anyhow::Result<Arc<dyn RecordStore>> {
    use market_ingest::ingest::store::PgRecordStore;

    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let store = PgRecordStore::connect(&url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.ensure_schema().await.context("creating ingested_records")?;
            tracing::info!(store = "postgres", "record store ready");
            Ok(Arc::new(store))
        }
        _ => {
            tracing::warn!(store = "memory", "DATABASE_URL unset; records are not persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store() -> anyhow::Result<Arc<dyn RecordStore>> {
    tracing::info!(store = "memory", "record store ready");
    Ok(Arc::new(MemoryStore::new()))
}
