//! OpenTelemetry Protocol (OTLP) HTTP and gRPC receivers

mod encoding;
mod grpc;
mod http;

pub use grpc::OtlpGrpcServer;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use tower_http::decompression::RequestDecompressionLayer;

use crate::core::config::IngressConfig;
use crate::domain::IngressReceiver;

#[derive(Clone)]
pub struct OtlpState {
    pub receiver: Arc<IngressReceiver>,
    pub tenant_header: Arc<str>,
}

/// `/traces`, `/metrics` and `/logs`, meant to be nested under `/v1`
pub fn routes(receiver: Arc<IngressReceiver>, config: &IngressConfig) -> Router {
    let state = OtlpState {
        receiver,
        tenant_header: Arc::from(config.tenant_header.as_str()),
    };

    Router::new()
        .route("/traces", post(http::traces))
        .route("/metrics", post(http::metrics))
        .route("/logs", post(http::logs))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(RequestDecompressionLayer::new())
}
