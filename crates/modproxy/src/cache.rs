//! Two-tier module artifact cache

use crate::path::{escape_path, parse_path, ArtifactKind, ModRequest};
use buildstash_core::config::RetryConfig;
use buildstash_core::metrics::{Counter, MetricsRegistry};
use buildstash_core::{Error, Result};
use buildstash_store::{retry_with_backoff, LocalCache, ObjectStore, SingleFlight};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Configuration for the module proxy
#[derive(Debug, Clone)]
pub struct ModuleProxyConfig {
    /// Upstream registry base URL
    pub upstream: String,
    /// Object-store key prefix (the `module/` namespace is appended)
    pub key_prefix: String,
    /// Allowlisted checksum databases; the first entry serves lookups
    pub sumdbs: Vec<String>,
    /// How long `@latest` responses stay fresh locally
    pub latest_ttl: Duration,
    /// Retry policy for upstream fetches
    pub retry: RetryConfig,
    /// Log individual requests
    pub log_requests: bool,
}

impl Default for ModuleProxyConfig {
    fn default() -> Self {
        Self {
            upstream: "https://proxy.golang.org".into(),
            key_prefix: String::new(),
            sumdbs: vec!["sum.golang.org".into()],
            latest_ttl: Duration::from_secs(300),
            retry: RetryConfig::default(),
            log_requests: false,
        }
    }
}

/// A successful module-proxy response
#[derive(Debug, Clone)]
pub struct ModResponse {
    /// Content type of the body
    pub content_type: &'static str,
    /// Verbatim artifact bytes
    pub body: Bytes,
}

struct ModMetrics {
    hit_local: Arc<Counter>,
    hit_remote: Arc<Counter>,
    fetch_upstream: Arc<Counter>,
    error: Arc<Counter>,
}

/// Module-registry caching proxy
pub struct ModuleProxy {
    local: Arc<LocalCache>,
    store: Option<Arc<dyn ObjectStore>>,
    client: reqwest::Client,
    cfg: ModuleProxyConfig,
    flights: SingleFlight<String, Bytes>,
    metrics: ModMetrics,
}

impl ModuleProxy {
    /// Create the proxy over an existing local tier and optional remote tier.
    pub fn new(
        local: Arc<LocalCache>,
        store: Option<Arc<dyn ObjectStore>>,
        cfg: ModuleProxyConfig,
        registry: &MetricsRegistry,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::configuration(format!("build HTTP client: {e}")))?;
        Ok(Self {
            local,
            store,
            client,
            cfg,
            flights: SingleFlight::new(),
            metrics: ModMetrics {
                hit_local: registry.counter("mod.hit.local"),
                hit_remote: registry.counter("mod.hit.remote"),
                fetch_upstream: registry.counter("mod.fetch.upstream"),
                error: registry.counter("mod.error"),
            },
        })
    }

    /// Serve the request path (leading slash stripped). The response body is
    /// the verbatim artifact from the registry.
    pub async fn serve(&self, path: &str) -> Result<ModResponse> {
        let request = parse_path(path).ok_or_else(|| Error::not_found(path))?;
        if self.cfg.log_requests {
            debug!(path, "module request");
        }
        match request {
            ModRequest::Artifact {
                module,
                version,
                kind,
            } => {
                let rel = format!(
                    "module/{}/@v/{}.{}",
                    escape_path(&module),
                    escape_path(&version),
                    kind.ext()
                );
                let url = format!(
                    "{}/{}/@v/{}.{}",
                    self.cfg.upstream,
                    escape_path(&module),
                    escape_path(&version),
                    kind.ext()
                );
                let body = self.serve_immutable(rel, url).await?;
                Ok(ModResponse {
                    content_type: kind.content_type(),
                    body,
                })
            }
            ModRequest::Latest { module } => {
                let rel = format!("module/{}/@latest", escape_path(&module));
                let url = format!("{}/{}/@latest", self.cfg.upstream, escape_path(&module));
                let body = self.serve_mutable(rel, url).await?;
                Ok(ModResponse {
                    content_type: ArtifactKind::Info.content_type(),
                    body,
                })
            }
            ModRequest::Lookup { rest } => {
                let db = self
                    .cfg
                    .sumdbs
                    .first()
                    .ok_or_else(|| Error::configuration("no checksum database configured"))?;
                let rel = format!("module/sumdb/{db}/lookup/{}", escape_path(&rest));
                let url = format!("https://{db}/lookup/{rest}");
                let body = self.serve_immutable(rel, url).await?;
                Ok(ModResponse {
                    content_type: "text/plain; charset=utf-8",
                    body,
                })
            }
        }
    }

    /// Immutable artifact: local tier, then object store, then upstream.
    /// Concurrent misses for one key collapse into a single fetch, and all
    /// waiters see identical bytes.
    async fn serve_immutable(&self, rel: String, url: String) -> Result<Bytes> {
        match self.local.read_raw(&rel).await {
            Ok(Some(data)) => {
                self.metrics.hit_local.incr();
                return Ok(Bytes::from(data));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %rel, error = %e, "Local module read failed"),
        }

        let local = Arc::clone(&self.local);
        let store = self.store.clone();
        let client = self.client.clone();
        let retry = self.cfg.retry.clone();
        let remote = self.remote_key(&rel);
        let flight_rel = rel.clone();
        let hit_remote = Arc::clone(&self.metrics.hit_remote);
        let fetch_upstream = Arc::clone(&self.metrics.fetch_upstream);

        let outcome = self
            .flights
            .run(rel.clone(), move || async move {
                // Shared tier first.
                if let Some(store) = &store {
                    match store.get(&remote).await {
                        Ok(Some(data)) => {
                            hit_remote.incr();
                            local.put_bytes_raw(&flight_rel, &data).await?;
                            return Ok(data);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = %remote, error = %e, "Object store module read failed")
                        }
                    }
                }

                // Origin fetch, mirrored to both tiers.
                fetch_upstream.incr();
                let data = fetch_origin(&client, &retry, &url).await?;
                local.put_bytes_raw(&flight_rel, &data).await?;
                if let Some(store) = &store {
                    if let Err(e) = store.put(&remote, data.clone()).await {
                        warn!(key = %remote, error = %e, "Module mirror upload failed");
                    }
                }
                Ok(data)
            })
            .await;

        outcome.map_err(|e| {
            self.metrics.error.incr();
            shared_error(&e)
        })
    }

    /// Mutable endpoint (`@latest`): short local TTL, never uploaded to the
    /// object store.
    async fn serve_mutable(&self, rel: String, url: String) -> Result<Bytes> {
        match self.local.get_raw(&rel).await {
            Ok(Some(file)) => {
                let age = SystemTime::now()
                    .duration_since(file.modified)
                    .unwrap_or_default();
                if age < self.cfg.latest_ttl {
                    if let Ok(Some(data)) = self.local.read_raw(&rel).await {
                        self.metrics.hit_local.incr();
                        return Ok(Bytes::from(data));
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key = %rel, error = %e, "Local module stat failed"),
        }

        let local = Arc::clone(&self.local);
        let client = self.client.clone();
        let retry = self.cfg.retry.clone();
        let flight_rel = rel.clone();
        let fetch_upstream = Arc::clone(&self.metrics.fetch_upstream);

        let outcome = self
            .flights
            .run(rel, move || async move {
                fetch_upstream.incr();
                let data = fetch_origin(&client, &retry, &url).await?;
                local.put_bytes_raw(&flight_rel, &data).await?;
                Ok(data)
            })
            .await;

        outcome.map_err(|e| {
            self.metrics.error.incr();
            shared_error(&e)
        })
    }

    fn remote_key(&self, rel: &str) -> String {
        if self.cfg.key_prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{rel}", self.cfg.key_prefix)
        }
    }
}

/// Fetch `url` from the origin, retrying transient failures.
async fn fetch_origin(
    client: &reqwest::Client,
    retry: &RetryConfig,
    url: &str,
) -> Result<Bytes> {
    retry_with_backoff(retry, "fetch", || async {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::remote("fetch", e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            response
                .bytes()
                .await
                .map_err(|e| Error::remote("fetch", e.to_string()))
        } else if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::GONE
        {
            Err(Error::not_found(url))
        } else if status.is_server_error() {
            Err(Error::remote("fetch", format!("origin returned {status}")))
        } else {
            Err(Error::remote_fatal(
                "fetch",
                format!("origin returned {status}"),
            ))
        }
    })
    .await
}

/// Flatten a single-flight shared error back into the local taxonomy.
fn shared_error(err: &Arc<Error>) -> Error {
    match err.as_ref() {
        Error::NotFound { key } => Error::not_found(key.clone()),
        other => Error::remote_fatal("module", other.to_string()),
    }
}
