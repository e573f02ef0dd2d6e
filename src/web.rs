use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::actions;
use crate::relay::RelayEngine;
use crate::relay_config::RelayConfig;

// App state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayEngine,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(relay: RelayEngine, config: RelayConfig) -> Self {
        Self {
            relay,
            config: Arc::new(config),
        }
    }
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let start_time = Instant::now();

    info!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;
    let duration = start_time.elapsed();
    let status = response.status();

    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());
    info!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        status.as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

// Middleware to capture HTTP errors to Sentry
async fn sentry_error_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    if response.status().is_server_error() {
        let status = response.status();
        error!("HTTP {} error on {} {}", status.as_u16(), method, uri);

        sentry::configure_scope(|scope| {
            scope.set_tag("http.method", method.as_str());
            scope.set_tag("http.url", uri.to_string());
            scope.set_tag("http.status_code", status.as_u16().to_string());
        });

        sentry::capture_message(
            &format!("HTTP {} error on {} {}", status.as_u16(), method, uri),
            sentry::Level::Error,
        );
    }

    response
}

/// Build the application router
pub fn router(app_state: AppState) -> Router {
    // API sub-router rooted at "/data"
    let api_router = Router::new()
        .route("/status", get(actions::get_status))
        .route("/vehicles/live", get(actions::live_vehicles_websocket))
        .route("/vehicles/active", get(actions::get_active_vehicles))
        .route(
            "/vehicles/active/{vehicle_id}",
            get(actions::get_active_vehicle),
        )
        .with_state(app_state);

    Router::new()
        .nest("/data", api_router)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(middleware::from_fn(sentry_error_middleware))
        .layer(CorsLayer::permissive())
}

/// Serve the relay on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Web server failed")?;

    info!("Web server stopped");
    Ok(())
}

pub async fn start_web_server<F>(app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "web-server");
    });

    let bind_addr = format!("{}:{}", app_state.config.interface, app_state.config.port);
    info!("Starting web server on {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    serve(listener, app_state, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(RelayEngine::new(16), RelayConfig::default())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_active_vehicles_empty() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/data/vehicles/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "data": [] }));
    }

    #[tokio::test]
    async fn test_unknown_vehicle_is_404() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/data/vehicles/active/V404")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "errors": "Vehicle is not live" })
        );
    }

    #[tokio::test]
    async fn test_status_reports_relay_counts() {
        let state = test_state();
        let (_id, _rx) = state.relay.connect().await;

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/data/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["relay"]["connections"], 1);
        assert_eq!(body["data"]["relay"]["activeVehicles"], 0);
    }

    #[tokio::test]
    async fn test_websocket_route_requires_upgrade() {
        let response = router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/data/vehicles/live")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }
}
