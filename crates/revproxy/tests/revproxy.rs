//! Inner-proxy caching behavior against a live local origin.

use axum::extract::State;
use axum::http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatus, Uri};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use buildstash_core::metrics::MetricsRegistry;
use buildstash_revproxy::{ProxyRequest, RevProxy, RevProxyConfig};
use buildstash_store::{LocalCache, MemoryStore, ObjectStore};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

async fn origin_handler(
    State(hits): State<Arc<AtomicU64>>,
    uri: Uri,
    headers: AxumHeaderMap,
) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    match uri.path() {
        "/doc" => (AxumStatus::OK, AxumHeaderMap::new(), b"document-body".to_vec()),
        "/private" => {
            let mut out = AxumHeaderMap::new();
            out.insert("cache-control", "no-store".parse().unwrap());
            (AxumStatus::OK, out, b"secret".to_vec())
        }
        "/lane" => {
            let lane = headers
                .get("x-lane")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none")
                .to_string();
            let mut out = AxumHeaderMap::new();
            out.insert("vary", "X-Lane".parse().unwrap());
            (AxumStatus::OK, out, lane.into_bytes())
        }
        _ => (AxumStatus::NOT_FOUND, AxumHeaderMap::new(), Vec::new()),
    }
}

async fn spawn_origin() -> (SocketAddr, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let app = Router::new()
        .fallback(any(origin_handler))
        .with_state(Arc::clone(&hits));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

async fn new_proxy(store: Option<Arc<dyn ObjectStore>>) -> (TempDir, RevProxy) {
    let dir = TempDir::new().unwrap();
    let local = Arc::new(LocalCache::new(dir.path()).await.unwrap());
    let registry = MetricsRegistry::new();
    let proxy = RevProxy::new(local, store, RevProxyConfig::default(), &registry).unwrap();
    (dir, proxy)
}

fn get_request(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> ProxyRequest {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            http::header::HeaderName::try_from(*name).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ProxyRequest {
        method: Method::GET,
        url: format!("http://{addr}{path}"),
        headers: map,
        body: Bytes::new(),
    }
}

#[tokio::test]
async fn test_second_request_served_from_cache() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(None).await;

    let first = proxy.handle(get_request(addr, "/doc", &[])).await.unwrap();
    assert_eq!(first.status.as_u16(), 200);
    assert_eq!(first.body.as_ref(), b"document-body");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = proxy.handle(get_request(addr, "/doc", &[])).await.unwrap();
    assert_eq!(second.body, first.body);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "second request hit the origin");
}

#[tokio::test]
async fn test_no_store_is_never_cached() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(None).await;

    proxy.handle(get_request(addr, "/private", &[])).await.unwrap();
    proxy.handle(get_request(addr, "/private", &[])).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_non_get_passes_through_uncached() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(None).await;

    let mut request = get_request(addr, "/doc", &[]);
    request.method = Method::POST;
    proxy.handle(request.clone()).await.unwrap();
    proxy.handle(request).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_vary_splits_cache_entries() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(None).await;

    // First request records the Vary list for the URL.
    let a = proxy
        .handle(get_request(addr, "/lane", &[("x-lane", "alpha")]))
        .await
        .unwrap();
    assert_eq!(a.body.as_ref(), b"alpha");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Different value for the varying header: separate entry.
    let b = proxy
        .handle(get_request(addr, "/lane", &[("x-lane", "beta")]))
        .await
        .unwrap();
    assert_eq!(b.body.as_ref(), b"beta");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Both entries now serve from cache.
    let a2 = proxy
        .handle(get_request(addr, "/lane", &[("x-lane", "alpha")]))
        .await
        .unwrap();
    assert_eq!(a2.body.as_ref(), b"alpha");
    let b2 = proxy
        .handle(get_request(addr, "/lane", &[("x-lane", "beta")]))
        .await
        .unwrap();
    assert_eq!(b2.body.as_ref(), b"beta");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cross_tier_reuse_without_origin() {
    let (addr, hits) = spawn_origin().await;
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    {
        let (_dir, proxy) =
            new_proxy(Some(Arc::clone(&store) as Arc<dyn ObjectStore>)).await;
        proxy.handle(get_request(addr, "/doc", &[])).await.unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Fresh local tier, shared store: no new origin traffic.
    let (_dir, proxy) = new_proxy(Some(Arc::clone(&store) as Arc<dyn ObjectStore>)).await;
    let response = proxy.handle(get_request(addr, "/doc", &[])).await.unwrap();
    assert_eq!(response.body.as_ref(), b"document-body");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_origin_404_passes_through_uncached() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(None).await;

    let response = proxy.handle(get_request(addr, "/nope", &[])).await.unwrap();
    assert_eq!(response.status.as_u16(), 404);
    proxy.handle(get_request(addr, "/nope", &[])).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
