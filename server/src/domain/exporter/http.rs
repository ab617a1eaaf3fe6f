//! OTLP/HTTP exporter

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

use super::{ExportError, Exporter};
use crate::core::config::{ExporterConfig, TransportSecurity};
use crate::domain::batch::SignalKind;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Longest response body excerpt kept in error messages
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug)]
pub struct HttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExporter {
    pub fn new(config: &ExporterConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid exporter header name '{}'", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for exporter header '{}'", name))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.security() == TransportSecurity::TlsSkipVerify)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// `{endpoint}/v1/{traces,metrics,logs}`
    fn url(&self, kind: SignalKind) -> String {
        format!("{}/v1/{}", self.endpoint, kind.as_str())
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn export(&self, kind: SignalKind, payload: Bytes) -> Result<(), ExportError> {
        let response = self
            .client
            .post(self.url(kind))
            .body(payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

fn classify_send_error(err: reqwest::Error) -> ExportError {
    if err.is_builder() {
        ExportError::Permanent(err.to_string())
    } else {
        // Timeouts, refused connections, resets, TLS handshakes
        ExportError::Transient(err.to_string())
    }
}

/// Map a non-2xx response to a failure class
fn classify_status(status: StatusCode, body: &str) -> ExportError {
    let mut excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    if excerpt.len() < body.len() {
        excerpt.push_str("...");
    }
    let message = format!("HTTP {}: {}", status.as_u16(), excerpt.trim());
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ExportError::Transient(message),
        s if s.is_server_error() => ExportError::Transient(message),
        _ => ExportError::Permanent(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::post;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Backend {
        status: AtomicU16,
        seen: Mutex<Vec<(String, Option<String>, Option<String>, usize)>>,
    }

    async fn receive(
        State(backend): State<Arc<Backend>>,
        Path(signal): Path<String>,
        headers: AxumHeaders,
        body: Bytes,
    ) -> axum::http::StatusCode {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
        backend
            .seen
            .lock()
            .push((signal, header("content-type"), header("x-api-key"), body.len()));
        axum::http::StatusCode::from_u16(backend.status.load(Ordering::Relaxed))
            .unwrap_or(axum::http::StatusCode::OK)
    }

    async fn spawn_backend(status: u16) -> (Arc<Backend>, String) {
        let backend = Arc::new(Backend::default());
        backend.status.store(status, Ordering::Relaxed);
        let app = Router::new()
            .route("/v1/{signal}", post(receive))
            .with_state(Arc::clone(&backend));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (backend, format!("http://{}", addr))
    }

    fn exporter(endpoint: &str) -> HttpExporter {
        let mut config = ExporterConfig::http(endpoint);
        config.timeout_ms = 2_000;
        config.headers.insert("x-api-key".to_string(), "secret".to_string());
        HttpExporter::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_export_posts_protobuf_to_signal_path() {
        let (backend, endpoint) = spawn_backend(200).await;
        let exporter = exporter(&format!("{}/", endpoint));

        exporter
            .export(SignalKind::Metrics, Bytes::from_static(b"\x0a\x00"))
            .await
            .unwrap();

        let seen = backend.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "metrics");
        assert_eq!(seen[0].1.as_deref(), Some(PROTOBUF_CONTENT_TYPE));
        assert_eq!(seen[0].2.as_deref(), Some("secret"));
        assert_eq!(seen[0].3, 2);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let (_backend, endpoint) = spawn_backend(503).await;
        let err = exporter(&endpoint)
            .export(SignalKind::Logs, Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let (_backend, endpoint) = spawn_backend(400).await;
        let err = exporter(&endpoint)
            .export(SignalKind::Traces, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Permanent(msg) if msg.starts_with("HTTP 400")));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = exporter(&format!("http://{}", addr))
            .export(SignalKind::Logs, Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_status() {
        for code in [408, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, "").is_transient(), "{}", code);
        }
        for code in [400, 401, 403, 404, 413] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status, "").is_transient(), "{}", code);
        }
    }

    #[test]
    fn test_error_body_truncated() {
        let body = "x".repeat(ERROR_BODY_LIMIT * 2);
        let ExportError::Permanent(msg) = classify_status(StatusCode::BAD_REQUEST, &body) else {
            panic!("expected permanent");
        };
        assert!(msg.ends_with("..."));
        assert!(msg.len() < body.len());
    }
}
