//! Operational HTTP endpoints.
//!
//! - `/healthz`      : liveness
//! - `/metrics`      : Prometheus text format
//! - `/metrics.json` : meter snapshot as JSON

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::obs::metrics::MeterRegistry;

pub fn router(registry: MeterRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/metrics.json", get(metrics_json))
        .with_state(registry)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(registry): State<MeterRegistry>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        registry.render(),
    )
        .into_response()
}

async fn metrics_json(State(registry): State<MeterRegistry>) -> Response {
    Json(registry.snapshot()).into_response()
}
