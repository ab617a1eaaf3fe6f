//! Export pipeline domain logic
//!
//! - `batch` - Batches, signal kinds and resource attribute views
//! - `codec` - OTLP request decoding and splitting into batches
//! - `router` - Batch to pipeline routing rules
//! - `processors` - Attribute, shedding and batching stages
//! - `pipeline` - Per-pipeline chain, queue and export worker wiring
//! - `exporter` - OTLP/HTTP and OTLP/gRPC delivery with retry
//! - `health` - Memory and queue pressure, admission and readiness
//! - `ingest` - Submission intake shared by the HTTP and gRPC transports
//! - `stats` - Per-pipeline counters

pub mod batch;
pub mod codec;
pub mod exporter;
pub mod health;
pub mod ingest;
pub mod pipeline;
pub mod processors;
pub mod router;
pub mod stats;

pub use batch::{AttrValue, Batch, Records, ResourceAttributes, SequenceGenerator, SignalKind};
pub use codec::{Encoding, ExportRequest};
pub use health::{HealthMonitor, HealthSnapshot, HealthState, SysinfoProbe};
pub use ingest::{Acceptance, IngestError, IngressReceiver, Submission};
pub use pipeline::{Pipeline, PipelineRegistry};
pub use router::PipelineRouter;
pub use stats::PipelineStatsSnapshot;
