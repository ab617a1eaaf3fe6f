//! OTLP/HTTP content negotiation and status mapping

use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use prost::Message;
use serde::Serialize;

use crate::core::constants::BACKPRESSURE_RETRY_AFTER_SECS;
use crate::domain::codec::encode_message;
use crate::domain::{Encoding, IngestError};

/// Request encoding from Content-Type. Missing or unknown types are protobuf.
pub fn encoding_from_headers(headers: &HeaderMap) -> Encoding {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    Encoding::from_content_type(content_type)
}

/// Non-empty value of the tenant header
pub fn tenant_from_headers(headers: &HeaderMap, tenant_header: &str) -> Option<String> {
    headers
        .get(tenant_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Successful export response in the request's encoding
pub fn success_response<T>(response: &T, encoding: Encoding) -> Response
where
    T: Message + Serialize,
{
    match encode_message(response, encoding) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoding.content_type())],
            bytes,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode OTLP response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "Internal server error",
            )
                .into_response()
        }
    }
}

pub fn status_for(err: &IngestError) -> StatusCode {
    match err {
        IngestError::MalformedInput(_) | IngestError::NoRoute(_) => StatusCode::BAD_REQUEST,
        IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::Overloaded | IngestError::Storage(_) | IngestError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Rejection response. Retryable rejections carry `Retry-After`.
pub fn error_response(err: IngestError, encoding: Encoding) -> Response {
    let status = status_for(&err);
    match &err {
        IngestError::Overloaded | IngestError::ShuttingDown => {
            tracing::debug!(error = %err, "Submission refused")
        }
        IngestError::Storage(_) => tracing::error!(error = %err, "Submission failed"),
        _ => tracing::warn!(
            error = %err,
            encoding = encoding.content_type(),
            "Submission rejected"
        ),
    }

    if err.is_retryable() {
        (
            status,
            [
                (header::CONTENT_TYPE, "text/plain".to_string()),
                (
                    HeaderName::from_static("retry-after"),
                    BACKPRESSURE_RETRY_AFTER_SECS.to_string(),
                ),
            ],
            err.to_string(),
        )
            .into_response()
    } else {
        (status, [(header::CONTENT_TYPE, "text/plain")], err.to_string()).into_response()
    }
}
