//! Operational router: health, metrics, run/provider diagnostics and
//! administrative resets. Not a public data API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::history::RunHistory;
use crate::ingest::orchestrator::{IngestionOrchestrator, RunPhase, RunReport};
use crate::limits::{CircuitSnapshot, RateLimitSnapshot};
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub history: Arc<RunHistory>,
}

pub fn router(state: AppState, metrics: &Metrics) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/debug/last-run", get(debug_last_run))
        .route("/debug/history", get(debug_history))
        .route("/debug/providers", get(debug_providers))
        .route("/admin/providers/{id}/reset", post(admin_reset_provider))
        .with_state(state)
        .merge(metrics.router())
}

async fn debug_last_run(State(state): State<AppState>) -> Json<Option<RunReport>> {
    Json(state.history.last())
}

async fn debug_history(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<RunReport>> {
    let n = q
        .get("n")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(10)
        .min(100);
    Json(state.history.snapshot_last_n(n))
}

#[derive(serde::Serialize)]
struct ProvidersOut {
    phase: RunPhase,
    providers: Vec<String>,
    rate_limits: Vec<RateLimitSnapshot>,
    circuits: Vec<CircuitSnapshot>,
}

async fn debug_providers(State(state): State<AppState>) -> Json<ProvidersOut> {
    let o = &state.orchestrator;
    Json(ProvidersOut {
        phase: o.phase(),
        providers: o.provider_names(),
        rate_limits: o.limiters().snapshots(),
        circuits: o.breakers().snapshots(),
    })
}

#[derive(serde::Serialize)]
struct ResetOut {
    provider: String,
    reset: bool,
}

async fn admin_reset_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ResetOut>) {
    let reset = state.orchestrator.reset_provider(&id);
    let status = if reset {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(ResetOut { provider: id, reset }))
}
