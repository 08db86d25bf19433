//! HTTP server with graceful shutdown

use axum::http::{HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    config::Config,
    error::Result,
    health,
    middleware::{auth_middleware, correlation_middleware},
    pipeline,
    state::AppState,
};

/// Build the gateway router: control endpoints plus the pipeline fallback
///
/// Correlation stamping is the outermost middleware so even auth failures
/// echo the id; credential extraction runs inside it.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness))
        .route("/health/live", get(health::liveness))
        .route("/metrics", get(health::metrics))
        .route("/swagger", get(health::route_catalog))
        .fallback(pipeline::process)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum::middleware::from_fn(correlation_middleware))
        .with_state(state)
}

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the gateway until shutdown
    pub async fn serve(self, state: AppState) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.service.port));

        tracing::info!("Starting {} on {}", self.config.service.name, addr);

        let app = build_router(state.clone())
            .layer(self.build_cors_layer())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(self.config.service.timeout_secs),
            ))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Server listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        // Broker channels close before the process exits
        if let Some(bus) = state.bus() {
            if let Err(e) = bus.stop().await {
                tracing::warn!("Event bus shutdown failed: {}", e);
            }
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    fn build_cors_layer(&self) -> CorsLayer {
        let origins = &self.config.cors.allowed_origins;
        if origins.iter().any(|o| o == "*") {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(parsed))
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// Resolve on SIGTERM or ctrl-c
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCounterStore, MemoryWindowStore};
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> Router {
        let state = AppState::with_stores(
            Config::default(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(MemoryWindowStore::new()),
        )
        .await
        .unwrap();
        build_router(state)
    }

    #[tokio::test]
    async fn test_index_document() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["name"], "portway");
        assert!(value["endpoints"]["health"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_liveness_is_dependency_free() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health/live")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_correlation_header_is_echoed() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health/live")
                    .header("X-Correlation-Id", "corr-echo")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("X-Correlation-Id").unwrap(),
            "corr-echo"
        );
    }

    #[tokio::test]
    async fn test_unrouted_path_is_gateway_404() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/nowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_bearer_is_401_before_pipeline() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/anything")
                    .header("Authorization", "Bearer not-a-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_metrics_is_plain_text() {
        let app = app().await;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("portway_requests_total"));
    }
}
