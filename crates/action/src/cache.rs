//! Two-tier compile-action cache
//!
//! Lookup is local-first: the action record and output blob are read from
//! the local disk tier, falling back to the object store and materializing
//! locally on the way back. Stores are acknowledged as soon as the local
//! write is durable; promotion to the object store happens in a bounded
//! background pool and its failures never reach the client.

use buildstash_core::metrics::{Counter, Gauge, GaugeGuard, MetricsRegistry};
use buildstash_core::{Error, Result};
use buildstash_store::{LocalCache, ObjectStore, SingleFlight};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the action cache
#[derive(Debug, Clone)]
pub struct ActionCacheConfig {
    /// Prefix prepended to every object-store key
    pub key_prefix: String,
    /// Output blobs smaller than this are never uploaded
    pub min_upload_size: u64,
    /// Maximum simultaneous uploads
    pub upload_concurrency: usize,
    /// How long `close` waits for queued uploads before abandoning them
    pub drain_grace: Duration,
}

impl Default for ActionCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            min_upload_size: 0,
            upload_concurrency: 16,
            drain_grace: Duration::from_secs(30),
        }
    }
}

/// Pending uploads may queue well past the active bound before `put`
/// starts exerting backpressure.
const UPLOAD_QUEUE_FACTOR: usize = 64;

/// Action record mapping an action fingerprint to its artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    /// Output fingerprint
    pub output: String,
    /// Artifact size in bytes
    pub size: u64,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct ActionHit {
    /// Output fingerprint
    pub output: String,
    /// Local path of the artifact bytes
    pub disk_path: PathBuf,
    /// Artifact size in bytes
    pub size: u64,
}

struct ActionMetrics {
    hit_local: Arc<Counter>,
    hit_remote: Arc<Counter>,
    miss: Arc<Counter>,
    put_total: Arc<Counter>,
    put_uploaded: Arc<Counter>,
    put_skipped_small: Arc<Counter>,
    put_skipped_exists: Arc<Counter>,
    upload_error: Arc<Counter>,
    inflight_gets: Arc<Gauge>,
    inflight_uploads: Arc<Gauge>,
}

impl ActionMetrics {
    fn publish(registry: &MetricsRegistry) -> Self {
        Self {
            hit_local: registry.counter("action.get.hit.local"),
            hit_remote: registry.counter("action.get.hit.remote"),
            miss: registry.counter("action.get.miss"),
            put_total: registry.counter("action.put.total"),
            put_uploaded: registry.counter("action.put.uploaded"),
            put_skipped_small: registry.counter("action.put.skipped.small"),
            put_skipped_exists: registry.counter("action.put.skipped.exists"),
            upload_error: registry.counter("action.upload.error"),
            inflight_gets: registry.gauge("action.inflight.gets"),
            inflight_uploads: registry.gauge("action.inflight.uploads"),
        }
    }
}

/// Two-tier compile-action cache
pub struct ActionCache {
    local: Arc<LocalCache>,
    store: Option<Arc<dyn ObjectStore>>,
    cfg: ActionCacheConfig,
    flights: SingleFlight<String, Option<ActionEntry>>,
    queue_sem: Arc<Semaphore>,
    upload_sem: Arc<Semaphore>,
    uploads: Mutex<JoinSet<()>>,
    metrics: ActionMetrics,
}

impl ActionCache {
    /// Create the cache over an existing local tier and optional remote tier.
    pub fn new(
        local: Arc<LocalCache>,
        store: Option<Arc<dyn ObjectStore>>,
        cfg: ActionCacheConfig,
        registry: &MetricsRegistry,
    ) -> Self {
        let metrics = ActionMetrics::publish(registry);
        Self {
            local,
            store,
            queue_sem: Arc::new(Semaphore::new(cfg.upload_concurrency * UPLOAD_QUEUE_FACTOR)),
            upload_sem: Arc::new(Semaphore::new(cfg.upload_concurrency)),
            cfg,
            flights: SingleFlight::new(),
            uploads: Mutex::new(JoinSet::new()),
            metrics,
        }
    }

    /// Look up `action_key`.
    ///
    /// Remote-tier failures degrade to a miss: the worker rebuilds the
    /// action instead of failing.
    pub async fn get(&self, action_key: &str) -> Result<Option<ActionHit>> {
        check_fingerprint(action_key)?;
        let _inflight = GaugeGuard::acquire(&self.metrics.inflight_gets);

        // Local action record first.
        if let Some(entry) = self.read_local_entry(action_key).await {
            if let Some(hit) = self.local_output(&entry).await {
                self.metrics.hit_local.incr();
                return Ok(Some(hit));
            }
            // Record without its blob: promote the blob back from the
            // object store if we can.
            if self.store.is_some() {
                match self.fetch_output(&entry).await {
                    Ok(Some(hit)) => {
                        self.metrics.hit_remote.incr();
                        return Ok(Some(hit));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(action = action_key, error = %e, "Remote output fetch failed");
                    }
                }
            }
            self.metrics.miss.incr();
            return Ok(None);
        }

        // No local record: consult the object store, collapsing concurrent
        // misses for the same action into one fetch.
        let Some(store) = self.store.clone() else {
            self.metrics.miss.incr();
            return Ok(None);
        };

        let local = Arc::clone(&self.local);
        let action = action_key.to_string();
        let remote_action = self.remote_key("action", action_key);
        let prefix = self.cfg.key_prefix.clone();
        let outcome = self
            .flights
            .run(action.clone(), move || {
                fetch_action_remote(store, local, action, remote_action, prefix)
            })
            .await;

        match outcome {
            Ok(Some(entry)) => {
                // The flight materialized both records locally.
                if let Some(hit) = self.local_output(&entry).await {
                    self.metrics.hit_remote.incr();
                    return Ok(Some(hit));
                }
                self.metrics.miss.incr();
                Ok(None)
            }
            Ok(None) => {
                self.metrics.miss.incr();
                Ok(None)
            }
            Err(e) => {
                warn!(action = action_key, error = %e, "Remote action fetch failed");
                self.metrics.miss.incr();
                Ok(None)
            }
        }
    }

    /// Record an action result whose artifact bytes are at `body_path`.
    ///
    /// Returns once the local write is durable; promotion to the object
    /// store happens in the background.
    pub async fn put(
        &self,
        action_key: &str,
        output_key: &str,
        body_path: &Path,
        size: u64,
    ) -> Result<()> {
        check_fingerprint(action_key)?;
        check_fingerprint(output_key)?;
        self.metrics.put_total.incr();

        let disk_path = self
            .local
            .put_file(&format!("output/{output_key}"), body_path)
            .await?;

        let entry = ActionEntry {
            output: output_key.to_string(),
            size,
            created_at: Utc::now(),
        };
        let entry_json = serde_json::to_vec(&entry)
            .map_err(|e| Error::serialization(format!("encode action entry: {e}")))?;
        self.local
            .put_bytes(&format!("action/{action_key}"), &entry_json)
            .await?;

        if self.store.is_some() {
            self.enqueue_upload(action_key, entry, entry_json, disk_path)
                .await;
        }
        Ok(())
    }

    /// Convenience for callers holding the artifact in memory.
    pub async fn put_bytes(&self, action_key: &str, output_key: &str, body: &[u8]) -> Result<()> {
        check_fingerprint(action_key)?;
        check_fingerprint(output_key)?;
        self.metrics.put_total.incr();

        let disk_path = self
            .local
            .put_bytes(&format!("output/{output_key}"), body)
            .await?;

        let entry = ActionEntry {
            output: output_key.to_string(),
            size: body.len() as u64,
            created_at: Utc::now(),
        };
        let entry_json = serde_json::to_vec(&entry)
            .map_err(|e| Error::serialization(format!("encode action entry: {e}")))?;
        self.local
            .put_bytes(&format!("action/{action_key}"), &entry_json)
            .await?;

        if self.store.is_some() {
            self.enqueue_upload(action_key, entry, entry_json, disk_path)
                .await;
        }
        Ok(())
    }

    /// Drain queued uploads, waiting up to the configured grace period.
    pub async fn close(&self) -> Result<()> {
        let mut uploads = self.uploads.lock().await;
        let deadline = Instant::now() + self.cfg.drain_grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, uploads.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(()),
                Err(_) => {
                    let abandoned = uploads.len();
                    uploads.abort_all();
                    warn!(abandoned, "Upload drain grace expired");
                    return Err(Error::remote_fatal(
                        "close",
                        format!("{abandoned} uploads abandoned"),
                    ));
                }
            }
        }
    }

    async fn read_local_entry(&self, action_key: &str) -> Option<ActionEntry> {
        let key = format!("action/{action_key}");
        let bytes = match self.local.read(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(action = action_key, error = %e, "Local action read failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(action = action_key, error = %e, "Corrupt action record, discarding");
                let _ = self.local.remove(&key).await;
                None
            }
        }
    }

    /// Local output blob for `entry`, deleting it when truncated.
    async fn local_output(&self, entry: &ActionEntry) -> Option<ActionHit> {
        let key = format!("output/{}", entry.output);
        let file = match self.local.get(&key).await {
            Ok(Some(file)) => file,
            Ok(None) => return None,
            Err(e) => {
                warn!(output = %entry.output, error = %e, "Local output stat failed");
                return None;
            }
        };
        if file.size != entry.size {
            debug!(
                output = %entry.output,
                expected = entry.size,
                actual = file.size,
                "Truncated output blob, discarding"
            );
            let _ = self.local.remove(&key).await;
            return None;
        }
        Some(ActionHit {
            output: entry.output.clone(),
            disk_path: file.path,
            size: file.size,
        })
    }

    /// Fetch the output blob for a locally-known entry from the object store
    /// and materialize it.
    async fn fetch_output(&self, entry: &ActionEntry) -> Result<Option<ActionHit>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let remote = self.remote_key("output", &entry.output);
        let Some(body) = store.get(&remote).await? else {
            return Ok(None);
        };
        let disk_path = self
            .local
            .put_bytes(&format!("output/{}", entry.output), &body)
            .await?;
        Ok(Some(ActionHit {
            output: entry.output.clone(),
            disk_path,
            size: body.len() as u64,
        }))
    }

    async fn enqueue_upload(
        &self,
        action_key: &str,
        entry: ActionEntry,
        entry_json: Vec<u8>,
        body_path: PathBuf,
    ) {
        let Some(store) = self.store.clone() else {
            return;
        };
        // The queue permit is held for the task's lifetime; acquiring it
        // here is what backpressures `put` when the queue is saturated.
        let Ok(queue_permit) = Arc::clone(&self.queue_sem).acquire_owned().await else {
            return;
        };

        let upload_sem = Arc::clone(&self.upload_sem);
        let remote_action = self.remote_key("action", action_key);
        let remote_output = self.remote_key("output", &entry.output);
        let min_upload_size = self.cfg.min_upload_size;
        let inflight = Arc::clone(&self.metrics.inflight_uploads);
        let uploaded = Arc::clone(&self.metrics.put_uploaded);
        let skipped_small = Arc::clone(&self.metrics.put_skipped_small);
        let skipped_exists = Arc::clone(&self.metrics.put_skipped_exists);
        let upload_error = Arc::clone(&self.metrics.upload_error);

        self.uploads.lock().await.spawn(async move {
            let _queue_permit = queue_permit;
            let Ok(_permit) = upload_sem.acquire().await else {
                return;
            };
            let _inflight = GaugeGuard::acquire(&inflight);

            // Output blob: skip tiny blobs and blobs the store already has.
            if entry.size < min_upload_size {
                debug!(output = %entry.output, size = entry.size, "Output below upload threshold");
                skipped_small.incr();
            } else {
                let exists = match store.head(&remote_output).await {
                    Ok(found) => found.is_some(),
                    Err(e) => {
                        debug!(output = %entry.output, error = %e, "Head check failed, uploading anyway");
                        false
                    }
                };
                if exists {
                    skipped_exists.incr();
                } else {
                    match store.put_file(&remote_output, &body_path).await {
                        Ok(()) => uploaded.incr(),
                        Err(e) => {
                            upload_error.incr();
                            log_upload_error(&e, &remote_output);
                        }
                    }
                }
            }

            // The action record is small and authoritative: always upload.
            match store.put(&remote_action, entry_json.into()).await {
                Ok(()) => {}
                Err(e) => {
                    upload_error.incr();
                    log_upload_error(&e, &remote_action);
                }
            }
        });
    }

    fn remote_key(&self, kind: &str, key: &str) -> String {
        if self.cfg.key_prefix.is_empty() {
            format!("{kind}/{key}")
        } else {
            format!("{}/{kind}/{key}", self.cfg.key_prefix)
        }
    }
}

fn log_upload_error(err: &Error, key: &str) {
    match err {
        Error::UploadsDisabled => debug!(key, "Upload skipped, uploads disabled"),
        _ => warn!(key, error = %err, "Background upload failed"),
    }
}

/// Remote fetch run under single-flight: pull the action record, then its
/// output blob, and materialize both locally before the waiters re-read.
async fn fetch_action_remote(
    store: Arc<dyn ObjectStore>,
    local: Arc<LocalCache>,
    action_key: String,
    remote_action: String,
    key_prefix: String,
) -> Result<Option<ActionEntry>> {
    let Some(entry_bytes) = store.get(&remote_action).await? else {
        return Ok(None);
    };
    let entry: ActionEntry = serde_json::from_slice(&entry_bytes)
        .map_err(|e| Error::serialization(format!("decode remote action entry: {e}")))?;

    let remote_output = if key_prefix.is_empty() {
        format!("output/{}", entry.output)
    } else {
        format!("{key_prefix}/output/{}", entry.output)
    };
    // An action record whose blob is gone is a stale hint, not an error.
    let Some(body) = store.get(&remote_output).await? else {
        debug!(action = %action_key, output = %entry.output, "Stale action record, output missing remotely");
        return Ok(None);
    };

    local
        .put_bytes(&format!("output/{}", entry.output), &body)
        .await?;
    let entry = ActionEntry {
        size: body.len() as u64,
        ..entry
    };
    let entry_json = serde_json::to_vec(&entry)
        .map_err(|e| Error::serialization(format!("encode action entry: {e}")))?;
    local
        .put_bytes(&format!("action/{action_key}"), &entry_json)
        .await?;

    Ok(Some(entry))
}

fn check_fingerprint(key: &str) -> Result<()> {
    if key.len() >= 4 && key.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(Error::invalid_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_validation() {
        assert!(check_fingerprint(&"a".repeat(64)).is_ok());
        assert!(check_fingerprint("0123abcd").is_ok());
        assert!(check_fingerprint("ab").is_err());
        assert!(check_fingerprint("../etc").is_err());
        assert!(check_fingerprint("").is_err());
    }

    #[tokio::test]
    async fn test_remote_key_prefixing() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = Arc::new(LocalCache::new(dir.path()).await.unwrap());
        let registry = MetricsRegistry::new();
        let cache = ActionCache::new(
            local,
            None,
            ActionCacheConfig {
                key_prefix: "ci".into(),
                ..Default::default()
            },
            &registry,
        );
        assert_eq!(cache.remote_key("action", "abcd"), "ci/action/abcd");

        let dir2 = tempfile::TempDir::new().unwrap();
        let local2 = Arc::new(LocalCache::new(dir2.path()).await.unwrap());
        let registry2 = MetricsRegistry::new();
        let bare = ActionCache::new(local2, None, ActionCacheConfig::default(), &registry2);
        assert_eq!(bare.remote_key("output", "abcd"), "output/abcd");
    }
}
