//! OTLP request decoding and splitting into batches
//!
//! Supports both protobuf (application/x-protobuf) and JSON (application/json)
//! bodies per the OpenTelemetry Protocol specification.

use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use prost::Message;
use serde::{Deserialize, Serialize};

use super::batch::{Batch, Records, SequenceGenerator, SignalKind};

/// Wire encoding of a request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Protobuf,
    Json,
}

impl Encoding {
    /// Parse a Content-Type value. Anything other than JSON is treated as
    /// protobuf.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("application/json") {
            Encoding::Json
        } else {
            Encoding::Protobuf
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Protobuf => "application/x-protobuf",
            Encoding::Json => "application/json",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Protobuf(String),

    #[error("JSON decode error: {0}")]
    Json(String),
}

/// Decode a message from bytes based on its encoding
pub fn decode_message<T>(body: &[u8], encoding: Encoding) -> Result<T, DecodeError>
where
    T: Message + Default + for<'de> Deserialize<'de>,
{
    match encoding {
        Encoding::Protobuf => T::decode(body).map_err(|e| DecodeError::Protobuf(e.to_string())),
        Encoding::Json => serde_json::from_slice(body).map_err(|e| DecodeError::Json(e.to_string())),
    }
}

/// Encode a message (requests or responses) based on the target encoding
pub fn encode_message<T>(message: &T, encoding: Encoding) -> Result<Vec<u8>, String>
where
    T: Message + Serialize,
{
    match encoding {
        Encoding::Protobuf => Ok(message.encode_to_vec()),
        Encoding::Json => serde_json::to_vec(message).map_err(|e| e.to_string()),
    }
}

/// A decoded OTLP export request of any signal kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExportRequest {
    Metrics(ExportMetricsServiceRequest),
    Logs(ExportLogsServiceRequest),
    Traces(ExportTraceServiceRequest),
}

impl ExportRequest {
    pub fn decode(kind: SignalKind, body: &[u8], encoding: Encoding) -> Result<Self, DecodeError> {
        Ok(match kind {
            SignalKind::Metrics => ExportRequest::Metrics(decode_message(body, encoding)?),
            SignalKind::Logs => ExportRequest::Logs(decode_message(body, encoding)?),
            SignalKind::Traces => ExportRequest::Traces(decode_message(body, encoding)?),
        })
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            ExportRequest::Metrics(_) => SignalKind::Metrics,
            ExportRequest::Logs(_) => SignalKind::Logs,
            ExportRequest::Traces(_) => SignalKind::Traces,
        }
    }

    /// Split into one batch per resource entry, assigning sequence numbers in
    /// request order. Resources without records produce no batch.
    pub fn into_batches(self, seqs: &SequenceGenerator) -> Vec<Batch> {
        let batches = match self {
            ExportRequest::Metrics(req) => req
                .resource_metrics
                .into_iter()
                .map(|rm| (rm.resource, rm.schema_url, Records::Metrics(rm.scope_metrics)))
                .collect::<Vec<_>>(),
            ExportRequest::Logs(req) => req
                .resource_logs
                .into_iter()
                .map(|rl| (rl.resource, rl.schema_url, Records::Logs(rl.scope_logs)))
                .collect(),
            ExportRequest::Traces(req) => req
                .resource_spans
                .into_iter()
                .map(|rs| (rs.resource, rs.schema_url, Records::Spans(rs.scope_spans)))
                .collect(),
        };

        batches
            .into_iter()
            .filter(|(_, _, records)| records.count() > 0)
            .map(|(resource, schema_url, records)| {
                Batch::new(seqs.next_seq(), resource, schema_url, records)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::test_support::*;
    use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
    use opentelemetry_proto::tonic::trace::v1::ResourceSpans;

    fn traces_request() -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![
                ResourceSpans {
                    resource: Some(resource(&[("service.name", "api")])),
                    scope_spans: vec![span_scope(&[false, true])],
                    schema_url: String::new(),
                },
                ResourceSpans {
                    resource: Some(resource(&[("service.name", "web")])),
                    scope_spans: vec![span_scope(&[false])],
                    schema_url: "https://opentelemetry.io/schemas/1.21.0".into(),
                },
            ],
        }
    }

    #[test]
    fn test_encoding_from_content_type() {
        assert_eq!(
            Encoding::from_content_type("application/x-protobuf"),
            Encoding::Protobuf
        );
        assert_eq!(Encoding::from_content_type("application/json"), Encoding::Json);
        assert_eq!(
            Encoding::from_content_type("application/json; charset=utf-8"),
            Encoding::Json
        );
        assert_eq!(Encoding::from_content_type(""), Encoding::Protobuf);
        assert_eq!(Encoding::from_content_type("text/plain"), Encoding::Protobuf);
    }

    #[test]
    fn test_decode_protobuf() {
        let body = traces_request().encode_to_vec();
        let decoded = ExportRequest::decode(SignalKind::Traces, &body, Encoding::Protobuf).unwrap();
        assert_eq!(decoded, ExportRequest::Traces(traces_request()));
    }

    #[test]
    fn test_decode_json() {
        let body = serde_json::to_vec(&traces_request()).unwrap();
        let decoded = ExportRequest::decode(SignalKind::Traces, &body, Encoding::Json).unwrap();
        assert_eq!(decoded.kind(), SignalKind::Traces);
    }

    #[test]
    fn test_decode_json_minimal_body() {
        let decoded =
            ExportRequest::decode(SignalKind::Logs, br#"{"resourceLogs":[]}"#, Encoding::Json)
                .unwrap();
        assert_eq!(decoded, ExportRequest::Logs(ExportLogsServiceRequest::default()));
    }

    #[test]
    fn test_decode_invalid_protobuf() {
        let err = ExportRequest::decode(SignalKind::Metrics, &[0xff, 0xff, 0xff], Encoding::Protobuf)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Protobuf(_)));
    }

    #[test]
    fn test_decode_invalid_json() {
        let err =
            ExportRequest::decode(SignalKind::Metrics, b"{not json", Encoding::Json).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
        assert!(err.to_string().starts_with("JSON decode error"));
    }

    #[test]
    fn test_into_batches_one_per_resource() {
        let seqs = SequenceGenerator::new();
        let batches = ExportRequest::Traces(traces_request()).into_batches(&seqs);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].seq(), 1);
        assert_eq!(batches[1].seq(), 2);
        assert_eq!(batches[0].record_count(), 2);
        assert_eq!(
            batches[1].attributes().get_str("service.name").as_deref(),
            Some("web")
        );
    }

    #[test]
    fn test_into_batches_skips_empty_resources() {
        let request = ExportMetricsServiceRequest {
            resource_metrics: vec![
                ResourceMetrics {
                    resource: Some(resource(&[("service", "api")])),
                    scope_metrics: vec![],
                    schema_url: String::new(),
                },
                ResourceMetrics {
                    resource: None,
                    scope_metrics: vec![gauge_scope(3)],
                    schema_url: String::new(),
                },
            ],
        };
        let batches = ExportRequest::Metrics(request).into_batches(&SequenceGenerator::new());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].record_count(), 3);
    }

    #[test]
    fn test_encode_message_json_and_protobuf() {
        let request = traces_request();
        let pb = encode_message(&request, Encoding::Protobuf).unwrap();
        assert_eq!(ExportTraceServiceRequest::decode(pb.as_slice()).unwrap(), request);
        let json = encode_message(&request, Encoding::Json).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&json).is_ok());
    }
}
