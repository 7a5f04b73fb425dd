//! Inner caching proxy
//!
//! Caches successful GET responses keyed by a hash of the request line plus
//! the request's values for whatever `Vary` headers the origin returned last
//! time for the same URL. The Vary list lives in a sidecar record per URL;
//! a response observed with a different list replaces the sidecar.

use buildstash_core::config::RetryConfig;
use buildstash_core::metrics::{Counter, MetricsRegistry};
use buildstash_core::{Error, Result};
use buildstash_store::{retry_with_backoff, LocalCache, ObjectStore};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Response statuses eligible for caching.
const CACHEABLE_STATUS: [u16; 4] = [200, 203, 301, 410];

/// Connection-scoped headers never cached or forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Configuration for the inner proxy
#[derive(Debug, Clone)]
pub struct RevProxyConfig {
    /// Object-store key prefix (the `revproxy/` namespace is appended)
    pub key_prefix: String,
    /// Retry policy for origin fetches
    pub retry: RetryConfig,
    /// Log individual requests
    pub log_requests: bool,
}

impl Default for RevProxyConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            retry: RetryConfig::default(),
            log_requests: false,
        }
    }
}

/// A plaintext request entering the proxy (TLS already terminated)
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Request method
    pub method: Method,
    /// Absolute URL of the origin resource
    pub url: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// The proxy's answer
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers (hop-by-hop stripped)
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Persisted response metadata; the body lives in a sibling entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Persisted Vary list for a URL.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct VarySidecar {
    names: Vec<String>,
}

struct RevMetrics {
    hit_local: Arc<Counter>,
    hit_remote: Arc<Counter>,
    miss: Arc<Counter>,
    stored: Arc<Counter>,
    error: Arc<Counter>,
}

/// Inner caching HTTP proxy
pub struct RevProxy {
    local: Arc<LocalCache>,
    store: Option<Arc<dyn ObjectStore>>,
    client: reqwest::Client,
    cfg: RevProxyConfig,
    metrics: RevMetrics,
}

impl RevProxy {
    /// Create the proxy over an existing local tier and optional remote tier.
    pub fn new(
        local: Arc<LocalCache>,
        store: Option<Arc<dyn ObjectStore>>,
        cfg: RevProxyConfig,
        registry: &MetricsRegistry,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::configuration(format!("build HTTP client: {e}")))?;
        Ok(Self {
            local,
            store,
            client,
            cfg,
            metrics: RevMetrics {
                hit_local: registry.counter("revproxy.hit.local"),
                hit_remote: registry.counter("revproxy.hit.remote"),
                miss: registry.counter("revproxy.miss"),
                stored: registry.counter("revproxy.stored"),
                error: registry.counter("revproxy.error"),
            },
        })
    }

    /// Serve a request for an intercepted host, consulting the cache.
    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        if request.method != Method::GET {
            return self.passthrough(request).await;
        }
        if self.cfg.log_requests {
            debug!(url = %request.url, "proxy request");
        }

        let vary = self.load_vary(&request.url).await;
        let key = response_key(&request.url, &vary.names, &request.headers);
        if let Some(response) = self.load_cached(&key).await {
            return Ok(response);
        }
        self.metrics.miss.incr();

        let response = match self.forward(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.metrics.error.incr();
                return Err(e);
            }
        };

        if is_cacheable(&response) {
            self.record(&request, &response, &vary).await;
        }
        Ok(response)
    }

    /// Forward a request without touching the cache (non-GET, or hosts the
    /// operator did not mark for interception).
    pub async fn passthrough(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        if self.cfg.log_requests {
            debug!(method = %request.method, url = %request.url, "pass-through");
        }
        let result = self.forward(&request).await;
        if result.is_err() {
            self.metrics.error.incr();
        }
        result
    }

    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        retry_with_backoff(&self.cfg.retry, "origin", || async {
            let mut headers = request.headers.clone();
            strip_hop_by_hop(&mut headers);
            let response = self
                .client
                .request(request.method.clone(), &request.url)
                .headers(headers)
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| Error::remote("origin", e.to_string()))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(Error::remote("origin", format!("origin returned {status}")));
            }
            let mut headers = response.headers().clone();
            strip_hop_by_hop(&mut headers);
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::remote("origin", e.to_string()))?;
            Ok(ProxyResponse {
                status,
                headers,
                body,
            })
        })
        .await
    }

    /// Look up the recorded Vary list for a URL, local tier first.
    async fn load_vary(&self, url: &str) -> VarySidecar {
        let rel = format!("revproxy/{}.vary", url_hash(url));
        if let Ok(Some(data)) = self.local.read(&rel).await {
            if let Ok(sidecar) = serde_json::from_slice(&data) {
                return sidecar;
            }
            let _ = self.local.remove(&rel).await;
        }
        if let Some(store) = &self.store {
            if let Ok(Some(data)) = store.get(&self.remote_key(&rel)).await {
                if let Ok(sidecar) = serde_json::from_slice(&data) {
                    let _ = self.local.put_bytes(&rel, &data).await;
                    return sidecar;
                }
            }
        }
        VarySidecar::default()
    }

    /// Fetch a cached response by key, promoting from the object store.
    async fn load_cached(&self, key: &str) -> Option<ProxyResponse> {
        let meta_rel = format!("revproxy/{key}.meta");
        let body_rel = format!("revproxy/{key}");

        // Local tier.
        if let Ok(Some(meta)) = self.local.read(&meta_rel).await {
            match decode_stored(&meta) {
                Some((status, headers)) => {
                    if let Ok(Some(body)) = self.local.read(&body_rel).await {
                        self.metrics.hit_local.incr();
                        return Some(ProxyResponse {
                            status,
                            headers,
                            body: Bytes::from(body),
                        });
                    }
                }
                None => {
                    debug!(key, "Corrupt cached response metadata, discarding");
                    let _ = self.local.remove(&meta_rel).await;
                    let _ = self.local.remove(&body_rel).await;
                }
            }
        }

        // Shared tier, materializing locally on the way back.
        let store = self.store.as_ref()?;
        let meta = store.get(&self.remote_key(&meta_rel)).await.ok()??;
        let (status, headers) = decode_stored(&meta)?;
        let body = store.get(&self.remote_key(&body_rel)).await.ok()??;
        let _ = self.local.put_bytes(&meta_rel, &meta).await;
        let _ = self.local.put_bytes(&body_rel, &body).await;
        self.metrics.hit_remote.incr();
        Some(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    /// Record a cacheable response in both tiers, updating the Vary sidecar
    /// when the origin's Vary list changed.
    async fn record(&self, request: &ProxyRequest, response: &ProxyResponse, prior: &VarySidecar) {
        let vary_now = match vary_names(&response.headers) {
            Some(names) => VarySidecar { names },
            // `Vary: *` means the response is never reusable.
            None => return,
        };

        let vary_rel = format!("revproxy/{}.vary", url_hash(&request.url));
        if vary_now != *prior {
            if let Ok(data) = serde_json::to_vec(&vary_now) {
                let _ = self.local.put_bytes(&vary_rel, &data).await;
                self.mirror(&vary_rel, Bytes::from(data)).await;
            }
        }

        let key = response_key(&request.url, &vary_now.names, &request.headers);
        let meta = StoredResponse {
            status: response.status.as_u16(),
            headers: headermap_to_vec(&response.headers),
        };
        let Ok(meta_bytes) = serde_json::to_vec(&meta) else {
            return;
        };

        let meta_rel = format!("revproxy/{key}.meta");
        let body_rel = format!("revproxy/{key}");
        if let Err(e) = self.local.put_bytes(&body_rel, &response.body).await {
            warn!(key = %key, error = %e, "Failed to cache response body");
            return;
        }
        if let Err(e) = self.local.put_bytes(&meta_rel, &meta_bytes).await {
            warn!(key = %key, error = %e, "Failed to cache response metadata");
            return;
        }
        self.metrics.stored.incr();

        self.mirror(&body_rel, response.body.clone()).await;
        self.mirror(&meta_rel, Bytes::from(meta_bytes)).await;
    }

    /// Best-effort copy into the shared tier.
    async fn mirror(&self, rel: &str, data: Bytes) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(&self.remote_key(rel), data).await {
                debug!(key = %rel, error = %e, "Response mirror upload failed");
            }
        }
    }

    fn remote_key(&self, rel: &str) -> String {
        if self.cfg.key_prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{rel}", self.cfg.key_prefix)
        }
    }
}

fn decode_stored(data: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let stored: StoredResponse = serde_json::from_slice(data).ok()?;
    let status = StatusCode::from_u16(stored.status).ok()?;
    Some((status, to_headermap(&stored.headers)))
}

fn is_cacheable(response: &ProxyResponse) -> bool {
    if !CACHEABLE_STATUS.contains(&response.status.as_u16()) {
        return false;
    }
    for value in response.headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        let value = value.to_ascii_lowercase();
        if value.contains("no-store") || value.contains("private") {
            return false;
        }
    }
    true
}

/// The response's Vary header names, lowercased and sorted; `None` for
/// `Vary: *`.
fn vary_names(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for value in headers.get_all(http::header::VARY) {
        let value = value.to_str().ok()?;
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return None;
            }
            names.push(name.to_ascii_lowercase());
        }
    }
    names.sort();
    names.dedup();
    Some(names)
}

fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Cache key: request line plus the request's values for the recorded Vary
/// headers.
fn response_key(url: &str, vary: &[String], request_headers: &HeaderMap) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    for name in vary {
        hasher.update(name.as_bytes());
        hasher.update(b": ");
        if let Some(value) = request_headers.get(name) {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may nominate additional hop-by-hop headers.
    let nominated: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(nominated.iter().map(String::as_str)) {
        while headers.remove(name).is_some() {}
    }
    headers.remove(http::header::HOST);
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value) = value.to_str() {
            items.push((name.as_str().to_string(), value.to_string()));
        }
    }
    items
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> ProxyResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        ProxyResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_cacheable_statuses() {
        for status in [200, 203, 301, 410] {
            assert!(is_cacheable(&response(status, &[])), "{status}");
        }
        for status in [201, 204, 302, 404, 500] {
            assert!(!is_cacheable(&response(status, &[])), "{status}");
        }
    }

    #[test]
    fn test_cache_control_blocks_caching() {
        assert!(!is_cacheable(&response(200, &[("cache-control", "no-store")])));
        assert!(!is_cacheable(&response(
            200,
            &[("cache-control", "private, max-age=60")]
        )));
        assert!(is_cacheable(&response(
            200,
            &[("cache-control", "public, max-age=60")]
        )));
    }

    #[test]
    fn test_vary_names_normalized() {
        let resp = response(200, &[("vary", "Accept-Encoding, User-Agent")]);
        assert_eq!(
            vary_names(&resp.headers).unwrap(),
            vec!["accept-encoding", "user-agent"]
        );

        let star = response(200, &[("vary", "*")]);
        assert!(vary_names(&star.headers).is_none());
    }

    #[test]
    fn test_response_key_depends_on_vary_values() {
        let mut headers_a = HeaderMap::new();
        headers_a.insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
        let mut headers_b = HeaderMap::new();
        headers_b.insert(
            http::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        let vary = vec!["accept-encoding".to_string()];
        let url = "https://origin.test/doc";
        let key_a = response_key(url, &vary, &headers_a);
        let key_b = response_key(url, &vary, &headers_b);
        assert_ne!(key_a, key_b);

        // Without a Vary list the header difference is invisible.
        assert_eq!(
            response_key(url, &[], &headers_a),
            response_key(url, &[], &headers_b)
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("close, x-custom"),
        );
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("1"),
        );
        headers.insert(
            http::header::TRANSFER_ENCODING,
            HeaderValue::from_static("chunked"),
        );
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert!(headers.get(http::header::CONNECTION).is_none());
        assert!(headers.get("x-custom").is_none());
        assert!(headers.get(http::header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(http::header::ACCEPT).is_some());
    }
}
