//! Pipeline statistics endpoint

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{HealthSnapshot, IngressReceiver, PipelineStatsSnapshot};

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    pub health: HealthSnapshot,
    pub pipelines: Vec<PipelineStatsSnapshot>,
}

/// Health snapshot and per-pipeline counters
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "stats",
    responses(
        (status = 200, description = "Current statistics", body = StatsResponse)
    )
)]
pub async fn get_stats(State(receiver): State<Arc<IngressReceiver>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        health: receiver.monitor().snapshot(),
        pipelines: receiver.pipelines().stats(),
    })
}
