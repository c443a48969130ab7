//! Credential-swapping proxy for sandbox containers.
//!
//! Sandboxes never hold real provider keys. Each container gets a random
//! bearer token scoped to this loopback listener; the proxy validates the
//! token against its registry on every call, applies a per-token rate
//! window, and forwards the request to the configured upstream with the
//! real key substituted into `Authorization`.

pub mod forward;
pub mod registry;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

pub use registry::TokenRegistry;

/// Upstream provider endpoints and their real keys.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub llm_base: String,
    pub llm_key: String,
    pub embeddings_base: String,
    pub embeddings_key: String,
}

pub struct ProxyState {
    pub registry: Arc<TokenRegistry>,
    pub upstream: UpstreamConfig,
    pub rate_limit: u32,
    pub http: reqwest::Client,
}

impl ProxyState {
    pub fn new(registry: Arc<TokenRegistry>, upstream: UpstreamConfig, rate_limit: u32) -> Self {
        Self { registry, upstream, rate_limit, http: reqwest::Client::new() }
    }
}

pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health).options(preflight))
        .fallback(forward::relay)
        .with_state(state)
}

async fn health(State(state): State<Arc<ProxyState>>) -> Json<Value> {
    Json(json!({"ok": true, "tokens": state.registry.len()}))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// Bind the proxy on loopback and serve it in a background task.
pub async fn serve(
    state: Arc<ProxyState>,
    port: u16,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "credential proxy listening on 127.0.0.1");
    let router = build_router(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("credential proxy server error: {e}");
        }
    }))
}
