//! HTTP middleware (request tracing, 404 handler)

use axum::body::to_bytes;
use axum::extract::Request;
use axum::http::StatusCode;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

const MAX_404_BODY_LOG: usize = 4 * 1024;

/// Per-request spans at debug level, so they only show with `SPOOL_LOG=debug`
pub fn trace() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG))
}

/// Handle 404 Not Found, logging the request at debug level
pub async fn handle_404(req: Request) -> StatusCode {
    if !tracing::enabled!(Level::DEBUG) {
        return StatusCode::NOT_FOUND;
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body_len = match to_bytes(req.into_body(), MAX_404_BODY_LOG).await {
        Ok(bytes) => bytes.len().to_string(),
        Err(_) => format!(">{}", MAX_404_BODY_LOG),
    };
    tracing::debug!(
        %method,
        %uri,
        %content_type,
        body_bytes = %body_len,
        "[404] no route, OTLP endpoints are /v1/traces, /v1/metrics and /v1/logs"
    );

    StatusCode::NOT_FOUND
}
