//! Liveness and readiness endpoints

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{HealthMonitor, HealthState};

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize, ToSchema)]
pub struct ReadyResponse {
    pub ready: bool,
    pub state: HealthState,
}

/// Liveness: the process is up and serving HTTP
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Readiness: pipelines are running and submissions are admitted
#[utoipa::path(
    get,
    path = "/api/v1/ready",
    tag = "health",
    responses(
        (status = 200, description = "Accepting submissions", body = ReadyResponse),
        (status = 503, description = "Starting, or refusing submissions under hard limit", body = ReadyResponse)
    )
)]
pub async fn ready(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let state = monitor.state();
    let ready = monitor.ready() && state != HealthState::HardLimit;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadyResponse { ready, state }))
}
