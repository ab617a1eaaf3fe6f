//! OpenAPI specification and Swagger UI

use axum::http::header;
use axum::response::{Html, IntoResponse, Json};
use utoipa::OpenApi;

use crate::api::routes::{health, stats};
use crate::domain::{HealthSnapshot, HealthState, PipelineStatsSnapshot};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Spool API",
        version = env!("CARGO_PKG_VERSION"),
        description = "Operational surface of the durable OTLP export pipeline"
    ),
    tags(
        (name = "health", description = "Liveness and readiness"),
        (name = "stats", description = "Health state and per-pipeline counters")
    ),
    paths(health::health, health::ready, stats::get_stats),
    components(schemas(
        health::HealthResponse,
        health::ReadyResponse,
        stats::StatsResponse,
        HealthSnapshot,
        HealthState,
        PipelineStatsSnapshot,
    ))
)]
pub struct ApiDoc;

/// Serve OpenAPI JSON specification
pub async fn openapi_json() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        Json(ApiDoc::openapi()),
    )
}

/// Serve Swagger UI from CDN
pub async fn swagger_ui_html() -> Html<&'static str> {
    Html(SWAGGER_UI_HTML)
}

const SWAGGER_UI_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Spool API</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script>
        window.onload = () => {
            window.ui = SwaggerUIBundle({ url: "/api/openapi.json", dom_id: '#swagger-ui' });
        };
    </script>
</body>
</html>"#;
