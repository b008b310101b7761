// tests/api_http.rs
//
// HTTP-level tests for the operational router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

mod common;

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{entities, CountingClient};
use market_ingest::api::{self, AppState};
use market_ingest::config::ProviderConfig;
use market_ingest::history::RunHistory;
use market_ingest::ingest::orchestrator::IngestionOrchestrator;
use market_ingest::ingest::store::MemoryStore;
use market_ingest::metrics::Metrics;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _; // for `oneshot`

const BODY_LIMIT: usize = 1024 * 1024;

fn setup() -> (Router, Arc<IngestionOrchestrator>) {
    let mut cfg = ProviderConfig::with_quota(5, 60);
    cfg.data_types = vec!["quote".into()];
    let history = Arc::new(RunHistory::with_capacity(10));
    let orchestrator = Arc::new(
        IngestionOrchestrator::builder(Arc::new(MemoryStore::new()))
            .provider("alphavantage", &cfg, Arc::new(CountingClient::quotes(171.5)))
            .sink(history.clone())
            .build(),
    );
    let app = api::router(
        AppState {
            orchestrator: orchestrator.clone(),
            history,
        },
        &Metrics::detached(),
    );
    (app, orchestrator)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let resp = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).expect("build request"))
        .await
        .expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _) = setup();
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn last_run_is_null_until_a_run_finishes() {
    let (app, orch) = setup();
    let (status, body) = get(&app, "/debug/last-run").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "null");

    orch.run(&entities(&["IBM"]), &CancellationToken::new()).await.unwrap();

    let (_, body) = get(&app, "/debug/last-run").await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["run_id"], 1);
    assert_eq!(v["status"], "completed");
    assert_eq!(v["records"]["inserted"], 1);

    let (_, body) = get(&app, "/debug/history?n=5").await;
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v.as_array().map(|a| a.len()), Some(1));
}

#[tokio::test]
async fn providers_endpoint_shows_limiter_and_circuit_state() {
    let (app, orch) = setup();
    orch.run(&entities(&["IBM"]), &CancellationToken::new()).await.unwrap();

    let (status, body) = get(&app, "/debug/providers").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_str(&body).unwrap();
    assert_eq!(v["phase"], "idle");
    assert_eq!(v["providers"][0], "alphavantage");
    assert_eq!(v["rate_limits"][0]["calls_in_window"], 1);
    assert_eq!(v["rate_limits"][0]["short_window_calls"], 5);
    assert_eq!(v["circuits"][0]["status"], "closed");
}

#[tokio::test]
async fn admin_reset_knows_registered_providers_only() {
    let (app, orch) = setup();
    orch.breakers().get("alphavantage").unwrap().trip();

    let req = |uri: &str| {
        Request::post(uri.to_string())
            .body(Body::empty())
            .expect("build request")
    };

    let resp = app
        .clone()
        .oneshot(req("/admin/providers/alphavantage/reset"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        orch.breakers().get("alphavantage").unwrap().snapshot().status,
        "closed"
    );

    let resp = app
        .clone()
        .oneshot(req("/admin/providers/nope/reset"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["reset"], false);
}

#[tokio::test]
async fn metrics_route_is_mounted() {
    let (app, _) = setup();
    let (status, _) = get(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}
