// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ingest::orchestrator::IngestionOrchestrator;

#[derive(Clone, Debug)]
pub struct IngestSchedulerCfg {
    pub interval_secs: u64,
    pub entities: Vec<String>,
}

/// Spawn the periodic ingest loop. The first run starts immediately; a run
/// already in progress when `cancel` fires stops before its next entity.
pub fn spawn_scheduler(
    orchestrator: Arc<IngestionOrchestrator>,
    cfg: IngestSchedulerCfg,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            counter!("ingest_runs_total").increment(1);
            match orchestrator.run(&cfg.entities, &cancel).await {
                Ok(report) => tracing::info!(
                    target: "ingest",
                    run_id = report.run_id,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    deferred = report.deferred,
                    "scheduled ingest tick"
                ),
                Err(e) => tracing::warn!(target: "ingest", error = %e, "scheduled run skipped"),
            }
        }
        tracing::info!(target: "ingest", "scheduler stopped");
    })
}
