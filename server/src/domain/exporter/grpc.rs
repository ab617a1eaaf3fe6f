//! OTLP/gRPC exporter

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use prost::Message;
use tonic::Code;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use super::{ExportError, Exporter};
use crate::core::config::{ExporterConfig, TransportSecurity};
use crate::domain::batch::SignalKind;

pub struct GrpcExporter {
    channel: Channel,
    metadata: MetadataMap,
    endpoint: String,
}

impl GrpcExporter {
    /// The channel connects on first use, so an unreachable backend does not
    /// block startup
    pub fn new(config: &ExporterConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut endpoint = Endpoint::from_shared(config.endpoint.clone())
            .with_context(|| format!("invalid gRPC endpoint '{}'", config.endpoint))?
            .timeout(timeout)
            .connect_timeout(timeout);
        if config.security() == TransportSecurity::Tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_webpki_roots())
                .context("failed to configure TLS")?;
        }

        let mut metadata = MetadataMap::new();
        for (name, value) in &config.headers {
            let key = MetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
                .with_context(|| format!("invalid exporter header name '{}'", name))?;
            let value = MetadataValue::try_from(value.as_str())
                .with_context(|| format!("invalid value for exporter header '{}'", name))?;
            metadata.insert(key, value);
        }

        Ok(Self {
            channel: endpoint.connect_lazy(),
            metadata,
            endpoint: config.endpoint.clone(),
        })
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.metadata.clone();
        request
    }
}

#[async_trait]
impl Exporter for GrpcExporter {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn export(&self, kind: SignalKind, payload: Bytes) -> Result<(), ExportError> {
        let corrupt = |e: prost::DecodeError| ExportError::Permanent(format!("corrupt queued payload: {}", e));
        let rejected = match kind {
            SignalKind::Traces => {
                let message = ExportTraceServiceRequest::decode(payload).map_err(corrupt)?;
                let response = TraceServiceClient::new(self.channel.clone())
                    .export(self.request(message))
                    .await
                    .map_err(classify_status)?;
                response
                    .into_inner()
                    .partial_success
                    .map(|p| (p.rejected_spans, p.error_message))
            }
            SignalKind::Metrics => {
                let message = ExportMetricsServiceRequest::decode(payload).map_err(corrupt)?;
                let response = MetricsServiceClient::new(self.channel.clone())
                    .export(self.request(message))
                    .await
                    .map_err(classify_status)?;
                response
                    .into_inner()
                    .partial_success
                    .map(|p| (p.rejected_data_points, p.error_message))
            }
            SignalKind::Logs => {
                let message = ExportLogsServiceRequest::decode(payload).map_err(corrupt)?;
                let response = LogsServiceClient::new(self.channel.clone())
                    .export(self.request(message))
                    .await
                    .map_err(classify_status)?;
                response
                    .into_inner()
                    .partial_success
                    .map(|p| (p.rejected_log_records, p.error_message))
            }
        };

        // Partially rejected data is not retried
        if let Some((count, message)) = rejected.filter(|(count, _)| *count > 0) {
            tracing::warn!(
                endpoint = %self.endpoint,
                kind = %kind,
                rejected = count,
                message = %message,
                "Backend partially rejected export"
            );
        }
        Ok(())
    }
}

fn classify_status(status: tonic::Status) -> ExportError {
    let message = format!("gRPC {:?}: {}", status.code(), status.message());
    if is_transient(status.code()) {
        ExportError::Transient(message)
    } else {
        ExportError::Permanent(message)
    }
}

fn is_transient(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::ResourceExhausted
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::Cancelled
            | Code::OutOfRange
            | Code::DataLoss
            | Code::Unknown
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        for code in [
            Code::Unavailable,
            Code::ResourceExhausted,
            Code::DeadlineExceeded,
            Code::Aborted,
            Code::Cancelled,
            Code::OutOfRange,
            Code::DataLoss,
            Code::Unknown,
        ] {
            assert!(is_transient(code), "{:?}", code);
        }
        for code in [
            Code::InvalidArgument,
            Code::PermissionDenied,
            Code::Unauthenticated,
            Code::Unimplemented,
            Code::NotFound,
        ] {
            assert!(!is_transient(code), "{:?}", code);
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = ExporterConfig::http(&format!("http://{}", addr));
        config.protocol = crate::core::config::ExportProtocol::Grpc;
        config.timeout_ms = 1_000;
        let exporter = GrpcExporter::new(&config).unwrap();

        let payload = Bytes::from(ExportLogsServiceRequest::default().encode_to_vec());
        let err = exporter.export(SignalKind::Logs, payload).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_permanent() {
        let mut config = ExporterConfig::http("http://127.0.0.1:4317");
        config.protocol = crate::core::config::ExportProtocol::Grpc;
        let exporter = GrpcExporter::new(&config).unwrap();
        let err = exporter
            .export(SignalKind::Traces, Bytes::from_static(b"\xff\xff\xff"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_header_metadata() {
        let mut config = ExporterConfig::http("http://127.0.0.1:4317");
        config.headers.insert("X-Api-Key".to_string(), "secret".to_string());
        let exporter = GrpcExporter::new(&config).unwrap();
        let request = exporter.request(());
        assert_eq!(
            request.metadata().get("x-api-key").and_then(|v| v.to_str().ok()),
            Some("secret")
        );
    }
}
