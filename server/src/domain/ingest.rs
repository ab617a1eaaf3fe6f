//! Ingress: admission, decoding, routing and dispatch of submissions
//!
//! A submission is acknowledged only after every batch it produced has been
//! durably enqueued (or deliberately shed/dropped by a processor). Routing
//! happens for all batches before any is dispatched, so a submission with an
//! unroutable resource is rejected as a whole.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use tokio::sync::watch;

use super::batch::{AttrValue, SequenceGenerator, SignalKind};
use super::codec::{Encoding, ExportRequest};
use super::health::HealthMonitor;
use super::pipeline::{EnqueueError, PipelineRegistry};
use super::router::{PipelineRouter, RouteError};
use crate::core::config::IngressConfig;
use crate::core::constants::TENANT_ATTR;
use crate::utils::debug::write_debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("malformed submission: {0}")]
    MalformedInput(String),

    #[error(transparent)]
    NoRoute(#[from] RouteError),

    #[error("collector is overloaded, retry later")]
    Overloaded,

    #[error("batch of {size} bytes exceeds queue capacity of {max_bytes} bytes")]
    PayloadTooLarge { size: u64, max_bytes: u64 },

    #[error("queue storage failure: {0}")]
    Storage(String),

    #[error("collector is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// Whether the client should retry the same submission later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Overloaded | IngestError::Storage(_) | IngestError::ShuttingDown
        )
    }
}

impl From<EnqueueError> for IngestError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::TooLarge { size, max_bytes } => Self::PayloadTooLarge { size, max_bytes },
            EnqueueError::Storage(msg) => Self::Storage(msg),
            EnqueueError::Closed => Self::ShuttingDown,
        }
    }
}

/// A raw submission from a transport
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: SignalKind,
    pub body: Bytes,
    pub encoding: Encoding,
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acceptance {
    pub batches: usize,
    pub records: usize,
}

pub struct IngressReceiver {
    router: PipelineRouter,
    pipelines: Arc<PipelineRegistry>,
    monitor: Arc<HealthMonitor>,
    seqs: SequenceGenerator,
    decode_timeout: Duration,
    debug_path: Option<PathBuf>,
    shutdown_rx: watch::Receiver<bool>,
}

impl IngressReceiver {
    pub fn new(
        router: PipelineRouter,
        pipelines: Arc<PipelineRegistry>,
        monitor: Arc<HealthMonitor>,
        config: &IngressConfig,
        debug_path: Option<PathBuf>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let last_seq = pipelines.max_batch_seq();
        if last_seq > 0 {
            tracing::debug!(last_seq, "Resuming batch sequence numbers");
        }
        Self {
            router,
            seqs: SequenceGenerator::starting_after(last_seq),
            pipelines,
            monitor,
            decode_timeout: Duration::from_millis(config.decode_timeout_ms),
            debug_path,
            shutdown_rx,
        }
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn pipelines(&self) -> &Arc<PipelineRegistry> {
        &self.pipelines
    }

    fn admit(&self) -> Result<(), IngestError> {
        if *self.shutdown_rx.borrow() {
            return Err(IngestError::ShuttingDown);
        }
        if !self.monitor.admit() {
            return Err(IngestError::Overloaded);
        }
        Ok(())
    }

    /// Decode and accept a raw body
    pub async fn submit(&self, submission: Submission) -> Result<Acceptance, IngestError> {
        self.admit()?;

        let Submission {
            kind,
            body,
            encoding,
            tenant,
        } = submission;
        let decode = tokio::task::spawn_blocking(move || ExportRequest::decode(kind, &body, encoding));
        let request = match tokio::time::timeout(self.decode_timeout, decode).await {
            Ok(Ok(Ok(request))) => request,
            Ok(Ok(Err(e))) => return Err(IngestError::MalformedInput(e.to_string())),
            Ok(Err(e)) => return Err(IngestError::MalformedInput(format!("decoder failed: {}", e))),
            Err(_) => {
                return Err(IngestError::MalformedInput(format!(
                    "decoding took longer than {}ms",
                    self.decode_timeout.as_millis()
                )));
            }
        };

        self.accept(request, tenant).await
    }

    /// Accept an already decoded request (gRPC)
    pub async fn submit_request(
        &self,
        request: ExportRequest,
        tenant: Option<String>,
    ) -> Result<Acceptance, IngestError> {
        self.admit()?;
        self.accept(request, tenant).await
    }

    async fn accept(&self, request: ExportRequest, tenant: Option<String>) -> Result<Acceptance, IngestError> {
        let kind = request.kind();
        let captured = self.debug_path.as_ref().map(|_| request.clone());

        let mut batches = request.into_batches(&self.seqs);
        if let Some(tenant) = &tenant {
            for batch in &mut batches {
                batch.set_attribute(TENANT_ATTR, AttrValue::from(tenant.as_str()));
            }
        }

        // Route everything first so nothing is enqueued for a rejected submission
        let mut routed = Vec::with_capacity(batches.len());
        for batch in batches {
            let name = self.router.route(&batch)?;
            let pipeline = self.pipelines.get(name).ok_or_else(|| RouteError::NoRoute {
                kind,
                attributes: format!("pipeline '{}' is not running", name),
            })?;
            routed.push((Arc::clone(pipeline), batch));
        }

        let acceptance = Acceptance {
            batches: routed.len(),
            records: routed.iter().map(|(_, b)| b.record_count()).sum(),
        };

        try_join_all(routed.into_iter().map(|(pipeline, batch)| async move {
            pipeline.dispatch(batch).await
        }))
        .await?;

        tracing::debug!(
            kind = %kind,
            batches = acceptance.batches,
            records = acceptance.records,
            tenant = tenant.as_deref().unwrap_or(""),
            "Accepted submission"
        );

        if let (Some(path), Some(request)) = (&self.debug_path, captured) {
            write_debug(path, &format!("{}.jsonl", kind.as_str()), tenant.as_deref(), &request).await;
        }

        Ok(acceptance)
    }
}
