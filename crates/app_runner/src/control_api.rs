use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use core_types::{GateSnapshot, KeySpace};
use stream_bus::StreamBus;

#[derive(Clone)]
pub(crate) struct ApiState {
    pub paused: Arc<AtomicBool>,
    pub bus: StreamBus,
    pub keys: KeySpace,
    pub symbols: Vec<String>,
    pub prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    paused: bool,
    symbols: usize,
}

pub(crate) fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/state/gates", get(gates))
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResp {
        status: "ok",
        paused: state.paused.load(Ordering::Relaxed),
        symbols: state.symbols.len(),
    })
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn gates(State(state): State<ApiState>) -> impl IntoResponse {
    let mut out: BTreeMap<String, GateSnapshot> = BTreeMap::new();
    for sym in &state.symbols {
        let fields = state.bus.hgetall(&state.keys.dyn_gate(sym)).await;
        out.insert(sym.clone(), GateSnapshot::from_fields(&fields));
    }
    Json(out)
}

async fn pause(State(state): State<ApiState>) -> impl IntoResponse {
    state.paused.store(true, Ordering::Relaxed);
    tracing::info!("routing paused via control api");
    Json(serde_json::json!({"ok": true, "paused": true}))
}

async fn resume(State(state): State<ApiState>) -> impl IntoResponse {
    state.paused.store(false, Ordering::Relaxed);
    tracing::info!("routing resumed via control api");
    Json(serde_json::json!({"ok": true, "paused": false}))
}
