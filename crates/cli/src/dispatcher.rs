//! Front-door HTTP handler
//!
//! One handler, fixed decision order: proxy-form requests go to the
//! intercept bridge (502 when it is not configured), `/debug/*` to
//! introspection, GET `/mod/*` to the module proxy with the prefix
//! stripped, everything else is 404.

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use buildstash_core::metrics::MetricsRegistry;
use buildstash_revproxy::Bridge;
use http::{Method, Request, StatusCode, Uri};
use std::sync::Arc;
use tower::ServiceExt;

/// Shared state for the dispatcher
#[derive(Clone)]
pub struct AppState {
    /// Metrics registry, rendered at `/debug/vars`
    pub metrics: Arc<MetricsRegistry>,
    /// Redacted configuration, rendered at `/debug/config`
    pub config: Arc<serde_json::Value>,
    /// Module proxy router, if enabled
    pub mod_router: Option<axum::Router>,
    /// Intercept bridge, if enabled
    pub bridge: Option<Arc<Bridge>>,
}

/// Build the front-door router.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    if is_proxy_form(&request) {
        return match &state.bridge {
            Some(bridge) => bridge.handle(request).await.into_response(),
            None => StatusCode::BAD_GATEWAY.into_response(),
        };
    }

    let path = request.uri().path().to_string();
    if let Some(debug_path) = path.strip_prefix("/debug/") {
        return debug_endpoint(&state, debug_path);
    }

    if path.starts_with("/mod/") && request.method() == Method::GET {
        if let Some(mod_router) = state.mod_router.clone() {
            let request = strip_prefix(request, "/mod");
            return match mod_router.oneshot(request).await {
                Ok(response) => response,
                Err(infallible) => match infallible {},
            };
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

/// A request asking us to proxy on the caller's behalf: CONNECT, or an
/// absolute-form URI whose authority matches the Host header.
fn is_proxy_form(request: &Request<Body>) -> bool {
    if request.method() == Method::CONNECT {
        return true;
    }
    request.uri().authority().is_some_and(|authority| {
        request
            .headers()
            .get(http::header::HOST)
            .and_then(|host| host.to_str().ok())
            .is_some_and(|host| host == authority.as_str())
    })
}

fn debug_endpoint(state: &AppState, path: &str) -> Response {
    match path {
        "vars" => Json(state.metrics.snapshot()).into_response(),
        "config" => Json((*state.config).clone()).into_response(),
        "healthz" => "ok".into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn strip_prefix(mut request: Request<Body>, prefix: &str) -> Request<Body> {
    let uri = request.uri();
    let path = uri.path();
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    let stripped = if stripped.is_empty() { "/" } else { stripped };
    let rewritten = match uri.query() {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    };
    if let Ok(new_uri) = rewritten.parse::<Uri>() {
        *request.uri_mut() = new_uri;
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn state() -> AppState {
        let metrics = Arc::new(MetricsRegistry::new());
        metrics.counter("action.get.miss").add(3);
        AppState {
            metrics,
            config: Arc::new(serde_json::json!({"concurrency": 64})),
            mod_router: None,
            bridge: None,
        }
    }

    async fn send(request: Request<Body>) -> Response {
        router(state()).oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = send(
            Request::builder()
                .uri("/debug/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_vars_snapshot() {
        let response = send(
            Request::builder()
                .uri("/debug/vars")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let vars: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(vars["action.get.miss"], 3);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let response = send(
            Request::builder()
                .uri("/something")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mod_without_proxy_is_404() {
        let response = send(
            Request::builder()
                .uri("/mod/example.com/foo/@latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_form_without_bridge_is_502() {
        let response = send(
            Request::builder()
                .uri("http://origin.test/doc")
                .header(http::header::HOST, "origin.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_strip_prefix_rewrites_uri() {
        let request = Request::builder()
            .uri("/mod/example.com/foo/@latest?x=1")
            .body(Body::empty())
            .unwrap();
        let stripped = strip_prefix(request, "/mod");
        assert_eq!(stripped.uri().path(), "/example.com/foo/@latest");
        assert_eq!(stripped.uri().query(), Some("x=1"));
    }
}
