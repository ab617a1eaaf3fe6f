//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;

use super::middleware;
use super::openapi::{openapi_json, swagger_ui_html};
use super::routes::{health, otlp_collector, stats};
use crate::core::config::IngressConfig;
use crate::core::constants::DEFAULT_BODY_LIMIT;
use crate::core::shutdown::ShutdownService;
use crate::domain::IngressReceiver;

pub struct ApiServer {
    addr: SocketAddr,
    router: Router,
}

impl ApiServer {
    pub fn new(
        host: &str,
        port: u16,
        receiver: Arc<IngressReceiver>,
        ingress: &IngressConfig,
    ) -> Result<Self> {
        let addr = SocketAddr::new(
            host.parse()
                .with_context(|| format!("Invalid server host: {}", host))?,
            port,
        );
        Ok(Self {
            addr,
            router: router(receiver, ingress),
        })
    }

    /// Serve until shutdown is triggered, then drain in-flight requests
    pub async fn start(self, shutdown: &ShutdownService) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.addr))?;
        tracing::debug!(addr = %self.addr, "Starting OTLP HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.wait())
        .await?;

        tracing::debug!("OTLP HTTP server stopped");
        Ok(())
    }
}

/// OTLP ingress under `/v1`, operational endpoints under `/api`
pub fn router(receiver: Arc<IngressReceiver>, ingress: &IngressConfig) -> Router {
    let monitor = Arc::clone(receiver.monitor());

    let operational = Router::new()
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/ready", get(health::ready).with_state(monitor))
        .route("/api/v1/stats", get(stats::get_stats).with_state(Arc::clone(&receiver)))
        .route("/api/openapi.json", get(openapi_json))
        .route("/api/docs", get(swagger_ui_html))
        .layer(CompressionLayer::new())
        .layer(DefaultBodyLimit::max(DEFAULT_BODY_LIMIT));

    Router::new()
        .nest("/v1", otlp_collector::routes(receiver, ingress))
        .merge(operational)
        .fallback(middleware::handle_404)
        .layer(middleware::trace())
}
