//! Request relay: validate the bearer, swap credentials, forward upstream.

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::ProxyState;

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 100 * 1024;

/// Upstream selection for a request path.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    Llm { path: String },
    Embeddings { path: String },
}

/// Paths containing `/embeddings/` go to the embeddings provider with the
/// prefix stripped; everything else is forwarded verbatim to the LLM
/// provider.
pub fn route_for(path_and_query: &str) -> Route {
    match path_and_query.find("/embeddings/") {
        Some(idx) => {
            let stripped = &path_and_query[idx + "/embeddings".len()..];
            Route::Embeddings { path: stripped.to_string() }
        }
        None => Route::Llm { path: path_and_query.to_string() },
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_string)
}

pub async fn relay(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    let Some(token) = bearer_token(request.headers()) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing bearer token");
    };
    // Registration is re-checked on every call; a revoked token fails
    // immediately regardless of any earlier success.
    let Some(job_id) = state.registry.job_for(&token) else {
        return error_response(StatusCode::UNAUTHORIZED, "unknown or revoked bearer token");
    };
    if !state.registry.check_rate(&token, state.rate_limit) {
        tracing::warn!(job_id = %job_id, "per-token upstream rate limit exceeded");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }

    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let content_type = request.headers().get(CONTENT_TYPE).cloned();

    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let (base, key, upstream_path) = match route_for(&path_and_query) {
        Route::Embeddings { path } => (
            state.upstream.embeddings_base.as_str(),
            state.upstream.embeddings_key.as_str(),
            path,
        ),
        Route::Llm { path } => {
            (state.upstream.llm_base.as_str(), state.upstream.llm_key.as_str(), path)
        }
    };
    let url = format!("{}{}", base.trim_end_matches('/'), upstream_path);

    let mut upstream_request = state
        .http
        .request(method, &url)
        .header(AUTHORIZATION, format!("Bearer {key}"))
        .body(body);
    if let Some(content_type) = &content_type {
        upstream_request = upstream_request.header(CONTENT_TYPE, content_type.clone());
    }

    match upstream_request.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
            match upstream.bytes().await {
                Ok(bytes) => {
                    let mut response = (status, bytes).into_response();
                    if let Some(content_type) = content_type {
                        response.headers_mut().insert(CONTENT_TYPE, content_type);
                    }
                    response
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "failed reading upstream response body");
                    error_response(StatusCode::BAD_GATEWAY, "upstream read failed")
                }
            }
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "upstream request failed");
            error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
