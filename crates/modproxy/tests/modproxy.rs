//! Module proxy behavior against a live local origin.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use buildstash_core::metrics::MetricsRegistry;
use buildstash_core::Error;
use buildstash_modproxy::{ModuleProxy, ModuleProxyConfig};
use buildstash_store::{LocalCache, MemoryStore, ObjectStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn origin_handler(State(hits): State<Arc<AtomicU64>>, uri: Uri) -> impl IntoResponse {
    if uri.path().contains("missing") {
        return (StatusCode::NOT_FOUND, Vec::new());
    }
    hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, b"artifact-bytes".to_vec())
}

async fn spawn_origin() -> (SocketAddr, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let app = Router::new()
        .fallback(get(origin_handler))
        .with_state(Arc::clone(&hits));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

async fn new_proxy(
    upstream: &str,
    store: Option<Arc<dyn ObjectStore>>,
    latest_ttl: Duration,
) -> (TempDir, Arc<ModuleProxy>) {
    let dir = TempDir::new().unwrap();
    let local = Arc::new(LocalCache::new(dir.path()).await.unwrap());
    let registry = MetricsRegistry::new();
    let proxy = ModuleProxy::new(
        local,
        store,
        ModuleProxyConfig {
            upstream: upstream.to_string(),
            latest_ttl,
            ..Default::default()
        },
        &registry,
    )
    .unwrap();
    (dir, Arc::new(proxy))
}

#[tokio::test]
async fn test_single_flight_module_fetch() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        None,
        Duration::from_secs(300),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move {
            proxy.serve("example.com/foo/@v/v1.2.3.zip").await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body.as_ref(), b"artifact-bytes");
        assert_eq!(response.content_type, "application/zip");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_artifact_served_from_object_store_without_origin() {
    let (addr, hits) = spawn_origin().await;
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

    // First worker populates both tiers.
    {
        let (_dir, proxy) = new_proxy(
            &format!("http://{addr}"),
            Some(Arc::clone(&store) as Arc<dyn ObjectStore>),
            Duration::from_secs(300),
        )
        .await;
        proxy.serve("example.com/foo/@v/v1.2.3.mod").await.unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(store.contains("module/example.com/foo/@v/v1.2.3.mod"));

    // A fresh worker with an empty local tier hits the shared tier only.
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        Some(Arc::clone(&store) as Arc<dyn ObjectStore>),
        Duration::from_secs(300),
    )
    .await;
    let response = proxy.serve("example.com/foo/@v/v1.2.3.mod").await.unwrap();
    assert_eq!(response.body.as_ref(), b"artifact-bytes");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_latest_is_local_only_and_revalidated() {
    let (addr, hits) = spawn_origin().await;
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        Some(Arc::clone(&store) as Arc<dyn ObjectStore>),
        Duration::ZERO,
    )
    .await;

    proxy.serve("example.com/foo/@latest").await.unwrap();
    // Zero TTL: the cached copy is immediately stale, so this refetches.
    proxy.serve("example.com/foo/@latest").await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    // Mutable responses never reach the object store.
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn test_latest_served_within_ttl() {
    let (addr, hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        None,
        Duration::from_secs(300),
    )
    .await;

    let first = proxy.serve("example.com/foo/@latest").await.unwrap();
    let second = proxy.serve("example.com/foo/@latest").await.unwrap();
    assert_eq!(first.body, second.body);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_module_is_not_found() {
    let (addr, _hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        None,
        Duration::from_secs(300),
    )
    .await;

    let err = proxy
        .serve("example.com/missing/@v/v1.0.0.info")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_unparseable_path_is_not_found() {
    let (addr, _hits) = spawn_origin().await;
    let (_dir, proxy) = new_proxy(
        &format!("http://{addr}"),
        None,
        Duration::from_secs(300),
    )
    .await;

    let err = proxy.serve("not-a-module-request").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}
