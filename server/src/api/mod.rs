//! API server and routes

pub mod middleware;
pub mod openapi;
pub mod routes;
mod server;

pub use routes::otlp_collector::OtlpGrpcServer;
pub use server::{ApiServer, router};
