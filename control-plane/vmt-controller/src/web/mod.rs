pub mod webhook;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use vmt_storage::Stores;

use crate::admission::{DeletionGuard, Validator};

#[derive(Clone)]
pub struct WebState {
    pub validator: Validator,
    pub guard: DeletionGuard,
}

impl WebState {
    pub fn new(stores: Stores) -> Self {
        Self {
            validator: Validator::new(stores.clone()),
            guard: DeletionGuard::new(stores),
        }
    }
}

pub fn build_router(stores: Stores) -> Router {
    // Expose both /health (preferred) and /healthz (legacy) for compatibility
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .route("/validate/templates", post(webhook::validate_template_handler))
        .route(
            "/validate/templateversions",
            post(webhook::validate_version_handler),
        )
        .with_state(WebState::new(stores))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn run_http_server(addr: SocketAddr, stores: Stores) -> anyhow::Result<()> {
    let app = build_router(stores);
    info!("HTTP listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
