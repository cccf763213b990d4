//! Protocol router.
//!
//! `/health` and `/healthz` answer directly. Everything else goes through
//! [`dispatch`], which accepts only GET and picks the verb from the path suffix.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use crate::coordinator::{Coordinator, Verb};
use crate::error::ApiError;
use modcache_core::CacheKey;

pub fn build_router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .fallback(dispatch)
        .with_state(Arc::new(coordinator))
}

async fn health() -> Response {
    ([(header::CONTENT_TYPE, "application/json")], r#"{"status":"ok"}"#).into_response()
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], message).into_response()
}

async fn dispatch(State(coordinator): State<Arc<Coordinator>>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let raw_path = request.uri().path();

    tracing::info!(remote = %remote, method = %method, path = %raw_path, "request");

    if method != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    // Dispatch and cache keys work on the decoded path.
    let Ok(path) = urlencoding::decode(raw_path).map(|p| p.into_owned()) else {
        return plain(StatusCode::NOT_FOUND, "Not found");
    };

    let Some(verb) = Verb::from_path(&path) else {
        return plain(StatusCode::NOT_FOUND, "Not found");
    };

    let result = match CacheKey::from_request_path(&path) {
        Ok(key) => coordinator.serve(verb, key).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            let err = ApiError::from(e);
            tracing::debug!(path = %path, status = err.status().as_u16(), error = %err.0, "request failed");
            err.into_response()
        }
    }
}
