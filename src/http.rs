//! Thin `axum` wrapper exposing `/metrics` and `/health`. The Prometheus
//! text exposition format itself is someone else's wire format; the router
//! around it is built the way the corpus builds its own API surfaces
//! (`neomind-api::server::router`).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::metrics::MetricRegistry;

async fn metrics_handler(State(metrics): State<Arc<MetricRegistry>>) -> impl IntoResponse {
    let body = metrics.encode_text();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn router(metrics: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Bind the listen socket. Split out from [`serve_with_listener`] so the
/// caller can treat a bind failure (exit code 2) distinctly from a config
/// failure (exit code 1).
pub async fn bind(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await
}

/// Serve the metrics/health router on an already-bound listener until
/// `shutdown` fires, mirroring `neomind-api::server::run`'s
/// bind-then-serve-with-graceful-shutdown shape.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    metrics: Arc<MetricRegistry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(metrics);
    tracing::info!(addr = %listener.local_addr()?, "metrics/health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok() {
        let metrics = Arc::new(MetricRegistry::new());
        let app = router(metrics);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_returns_text_exposition() {
        let metrics = Arc::new(MetricRegistry::new());
        metrics.record_failure("dev-http-test");
        let app = router(metrics);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("shelly_up"));
    }
}
