//! Axum handler for the module proxy

use crate::cache::ModuleProxy;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use buildstash_core::Error;
use std::sync::Arc;
use tracing::warn;

/// Router serving the module proxy. Mounted by the dispatcher with the
/// `/mod` prefix already stripped.
pub fn router(proxy: Arc<ModuleProxy>) -> Router {
    Router::new().fallback(handle).with_state(proxy)
}

async fn handle(State(proxy): State<Arc<ModuleProxy>>, request: Request<Body>) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let path = request.uri().path().trim_start_matches('/').to_string();

    match proxy.serve(&path).await {
        Ok(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, response.content_type)],
            response.body,
        )
            .into_response(),
        Err(Error::NotFound { .. }) | Err(Error::InvalidKey { .. }) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Module proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
