//! gRPC OTLP server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tonic::metadata::MetadataMap;
use tonic::transport::Server as TonicServer;
use tonic::{Request, Response, Status};

use opentelemetry_proto::tonic::collector::{
    logs::v1::{
        ExportLogsServiceRequest, ExportLogsServiceResponse,
        logs_service_server::{LogsService, LogsServiceServer},
    },
    metrics::v1::{
        ExportMetricsServiceRequest, ExportMetricsServiceResponse,
        metrics_service_server::{MetricsService, MetricsServiceServer},
    },
    trace::v1::{
        ExportTraceServiceRequest, ExportTraceServiceResponse,
        trace_service_server::{TraceService, TraceServiceServer},
    },
};

use crate::core::config::IngressConfig;
use crate::domain::{ExportRequest, IngestError, IngressReceiver};

pub struct OtlpGrpcServer {
    addr: SocketAddr,
    service: OtlpService,
    max_message_size: usize,
}

impl OtlpGrpcServer {
    pub fn new(
        host: &str,
        port: u16,
        receiver: Arc<IngressReceiver>,
        config: &IngressConfig,
    ) -> Result<Self> {
        let addr = SocketAddr::new(host.parse()?, port);
        Ok(Self {
            addr,
            service: OtlpService {
                receiver,
                tenant_header: Arc::from(config.tenant_header.as_str()),
            },
            max_message_size: config.max_body_bytes,
        })
    }

    pub async fn start(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let addr = self.addr;
        let limit = self.max_message_size;

        tracing::debug!(%addr, "Starting OTLP gRPC server");

        TonicServer::builder()
            .add_service(
                TraceServiceServer::new(self.service.clone())
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            )
            .add_service(
                MetricsServiceServer::new(self.service.clone())
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            )
            .add_service(
                LogsServiceServer::new(self.service)
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            )
            .serve_with_shutdown(addr, async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
                tracing::debug!("OTLP gRPC server shutting down");
            })
            .await?;

        Ok(())
    }
}

/// One service value answering all three OTLP export RPCs
#[derive(Clone)]
struct OtlpService {
    receiver: Arc<IngressReceiver>,
    tenant_header: Arc<str>,
}

impl OtlpService {
    async fn submit(&self, metadata: &MetadataMap, request: ExportRequest) -> Result<(), Status> {
        let tenant = tenant_from_metadata(metadata, &self.tenant_header);
        self.receiver
            .submit_request(request, tenant)
            .await
            .map(|_| ())
            .map_err(|e| {
                tracing::debug!(error = %e, "gRPC submission rejected");
                to_status(e)
            })
    }
}

fn tenant_from_metadata(metadata: &MetadataMap, tenant_header: &str) -> Option<String> {
    metadata
        .get(tenant_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn to_status(err: IngestError) -> Status {
    match err {
        IngestError::MalformedInput(_) | IngestError::PayloadTooLarge { .. } => {
            Status::invalid_argument(err.to_string())
        }
        IngestError::NoRoute(_) => Status::failed_precondition(err.to_string()),
        IngestError::Overloaded | IngestError::Storage(_) | IngestError::ShuttingDown => {
            Status::unavailable(err.to_string())
        }
    }
}

#[tonic::async_trait]
impl TraceService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        let (metadata, _, req) = request.into_parts();
        self.submit(&metadata, ExportRequest::Traces(req)).await?;
        Ok(Response::new(ExportTraceServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        let (metadata, _, req) = request.into_parts();
        self.submit(&metadata, ExportRequest::Metrics(req)).await?;
        Ok(Response::new(ExportMetricsServiceResponse::default()))
    }
}

#[tonic::async_trait]
impl LogsService for OtlpService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        let (metadata, _, req) = request.into_parts();
        self.submit(&metadata, ExportRequest::Logs(req)).await?;
        Ok(Response::new(ExportLogsServiceResponse::default()))
    }
}
