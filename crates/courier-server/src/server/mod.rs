//! HTTP and WebSocket server.
//!
//! A thin axum surface around the relay engine: REST endpoints for account
//! and conversation provisioning, a media upload/download pair, and the
//! `/ws` upgrade that all real-time traffic flows through.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use crate::config::CourierConfig;
use crate::relay::Dispatcher;
use crate::store::{SqliteStore, Store};

mod routes;

/// Shared application state.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn Store>,
    pub config: CourierConfig,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<dyn Store>, config: CourierConfig) -> Self {
        Self {
            dispatcher,
            store,
            config,
        }
    }
}

/// Start the server: open the database, run migrations, and serve until the
/// listener fails.
pub async fn start(config: CourierConfig) -> Result<()> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let store: Arc<dyn Store> = Arc::new(store);

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", config.upload_dir.display()))?;

    let dispatcher = Dispatcher::new(store.clone(), config.typing_ttl());
    let listen_addr = config.listen_addr.clone();
    let state = Arc::new(AppState::new(dispatcher, store, config));

    let app = create_router(state);
    info!(addr = %listen_addr, "starting courier server");

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Assemble the router with all routes and middleware.
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(routes::users::router(state.clone()))
        .merge(routes::conversations::router(state.clone()))
        .merge(routes::uploads::router(state.clone()))
        .merge(routes::websocket::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
}

/// Liveness probe for load balancers.
async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "courier-server",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let app = create_router(routes::test_support::state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "courier-server");
    }
}
