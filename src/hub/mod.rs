//! Local control API (hub)
//!
//! Small REST surface for driving the tunnel from another process:
//! status, connect, stop and a document preview.

mod auth;
mod common;
mod tunnel;

pub use auth::auth_middleware;
pub use common::{ApiError, ApiResult, ConnectRequest, PreviewRequest};

use crate::tunnel::TunnelManager;
use crate::{Result, VERSION};

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// API secret for authentication
    pub secret: String,
    /// Tunnel owner
    pub manager: Arc<TunnelManager>,
    /// Held for the duration of a connect or stop call
    pub connect_guard: Arc<Mutex<()>>,
    /// Engine version, asked once
    engine_version: Arc<OnceCell<Option<String>>>,
}

impl AppState {
    pub fn new(secret: String, manager: Arc<TunnelManager>) -> Self {
        AppState {
            secret,
            manager,
            connect_guard: Arc::new(Mutex::new(())),
            engine_version: Arc::new(OnceCell::new()),
        }
    }

    /// Engine version from the first successful or failed query
    pub async fn engine_version(&self) -> Option<String> {
        self.engine_version
            .get_or_init(|| async {
                match self.manager.engine_version().await {
                    Ok(version) => Some(version),
                    Err(e) => {
                        warn!("Querying engine version failed: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

/// Create the main router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route(
            "/tunnel",
            get(tunnel::get_tunnel)
                .post(tunnel::connect)
                .delete(tunnel::disconnect),
        )
        .route("/config/preview", post(tunnel::preview))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the control API server
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let router = create_router(state);
    info!("Starting control API on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "pulse-tunnel" }))
}

async fn version(State(state): State<AppState>) -> Json<Value> {
    let engine = state.engine_version().await;
    Json(json!({
        "version": VERSION,
        "engine": engine,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hello() {
        let response = hello().await;
        assert_eq!(response.0["hello"], "pulse-tunnel");
    }
}
