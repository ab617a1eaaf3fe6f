//! Spool: durable at-least-once OTLP export pipeline
//!
//! - `api` - OTLP/HTTP and OTLP/gRPC receivers, operational endpoints
//! - `core` - CLI, configuration, storage layout, shutdown
//! - `data` - Durable queue and dead-letter sink
//! - `domain` - Routing, processors, export workers, health
//! - `utils` - Shared helpers

pub mod api;
mod app;
pub mod core;
pub mod data;
pub mod domain;
pub mod utils;
