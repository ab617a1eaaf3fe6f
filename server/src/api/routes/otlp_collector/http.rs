//! OTLP/HTTP export handlers

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceResponse, metrics::v1::ExportMetricsServiceResponse,
    trace::v1::ExportTraceServiceResponse,
};
use prost::Message;
use serde::Serialize;

use super::OtlpState;
use super::encoding::{encoding_from_headers, error_response, success_response, tenant_from_headers};
use crate::domain::{SignalKind, Submission};

pub async fn traces(State(state): State<OtlpState>, headers: HeaderMap, body: Bytes) -> Response {
    export::<ExportTraceServiceResponse>(state, SignalKind::Traces, headers, body).await
}

pub async fn metrics(State(state): State<OtlpState>, headers: HeaderMap, body: Bytes) -> Response {
    export::<ExportMetricsServiceResponse>(state, SignalKind::Metrics, headers, body).await
}

pub async fn logs(State(state): State<OtlpState>, headers: HeaderMap, body: Bytes) -> Response {
    export::<ExportLogsServiceResponse>(state, SignalKind::Logs, headers, body).await
}

async fn export<R>(state: OtlpState, kind: SignalKind, headers: HeaderMap, body: Bytes) -> Response
where
    R: Message + Serialize + Default,
{
    let encoding = encoding_from_headers(&headers);
    let submission = Submission {
        kind,
        body,
        encoding,
        tenant: tenant_from_headers(&headers, &state.tenant_header),
    };

    match state.receiver.submit(submission).await {
        Ok(_) => success_response(&R::default(), encoding),
        Err(e) => error_response(e, encoding),
    }
}
