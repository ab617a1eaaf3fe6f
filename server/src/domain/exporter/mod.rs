//! Delivery of queued batches to downstream OTLP endpoints

mod backoff;
mod grpc;
mod http;
mod worker;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use backoff::BackoffPolicy;
pub use grpc::GrpcExporter;
pub use http::HttpExporter;
pub use worker::ExportWorker;

use super::batch::SignalKind;
use crate::core::config::{ExportProtocol, ExporterConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    /// Worth retrying: timeouts, connection failures, throttling, 5xx
    #[error("transient export failure: {0}")]
    Transient(String),
    /// The backend rejected the payload and will keep rejecting it
    #[error("permanent export failure: {0}")]
    Permanent(String),
}

impl ExportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExportError::Transient(_))
    }
}

#[async_trait]
pub trait Exporter: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Send one encoded `Export*ServiceRequest`
    async fn export(&self, kind: SignalKind, payload: Bytes) -> Result<(), ExportError>;
}

pub fn build_exporter(config: &ExporterConfig) -> anyhow::Result<Arc<dyn Exporter>> {
    Ok(match config.protocol {
        ExportProtocol::Http => Arc::new(HttpExporter::new(config)?),
        ExportProtocol::Grpc => Arc::new(GrpcExporter::new(config)?),
    })
}
