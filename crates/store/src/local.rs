//! Content-addressed local cache tier
//!
//! Keys map to a two-level sharded layout `<root>/<k[0..2]>/<k[2..4]>/<k>` to
//! bound directory fanout. Writes land in a temporary sibling and are renamed
//! into place, so readers never observe a partial file. A background pruner
//! removes entries whose modification time has aged past the configured TTL.
//!
//! Keys may carry a namespace prefix (`action/<fingerprint>`); only the final
//! path segment is sharded. The module tier stores artifacts under their
//! canonical registry paths instead, via the `*_raw` methods.

use buildstash_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum length of the sharded (final) key segment.
const MIN_KEY_LEN: usize = 4;

/// A resolved cache file
#[derive(Debug, Clone)]
pub struct CacheFile {
    /// Absolute path of the entry
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
}

/// Statistics from one pruning pass
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    /// Files inspected
    pub inspected: usize,
    /// Files removed
    pub removed: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
}

/// Content-addressed file store under a root directory
#[derive(Debug)]
pub struct LocalCache {
    root: PathBuf,
    next_tmp: AtomicU64,
}

impl LocalCache {
    /// Create a local cache rooted at `root`, creating the directory if
    /// needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self {
            root,
            next_tmp: AtomicU64::new(0),
        })
    }

    /// Root directory of this cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the sharded path for `key`.
    ///
    /// `key` may contain `/`-separated namespace segments; the final segment
    /// is sharded by its first four characters.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut segments: Vec<&str> = key.split('/').collect();
        let last = segments.pop().filter(|s| !s.is_empty());
        let Some(name) = last else {
            return Err(Error::invalid_key(key));
        };
        if name.len() < MIN_KEY_LEN || !name.is_ascii() {
            return Err(Error::invalid_key(key));
        }
        for seg in segments.iter().chain(std::iter::once(&name)) {
            if !segment_ok(seg) {
                return Err(Error::invalid_key(key));
            }
        }

        let mut path = self.root.clone();
        for seg in &segments {
            path.push(seg);
        }
        path.push(&name[0..2]);
        path.push(&name[2..4]);
        path.push(name);
        Ok(path)
    }

    /// Derive the unsharded path for a relative key, for tiers whose keys are
    /// already hierarchical paths (module artifacts).
    pub fn raw_path_for(&self, rel: &str) -> Result<PathBuf> {
        if rel.is_empty() {
            return Err(Error::invalid_key(rel));
        }
        let mut path = self.root.clone();
        for seg in rel.split('/') {
            if !segment_ok(seg) {
                return Err(Error::invalid_key(rel));
            }
            path.push(seg);
        }
        Ok(path)
    }

    /// Stat the entry for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<CacheFile>> {
        self.stat(self.path_for(key)?).await
    }

    /// Stat the entry at a raw relative path.
    pub async fn get_raw(&self, rel: &str) -> Result<Option<CacheFile>> {
        self.stat(self.raw_path_for(rel)?).await
    }

    /// Read the entry for `key` into memory.
    pub async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_path(self.path_for(key)?).await
    }

    /// Read the entry at a raw relative path into memory.
    pub async fn read_raw(&self, rel: &str) -> Result<Option<Vec<u8>>> {
        self.read_path(self.raw_path_for(rel)?).await
    }

    /// Atomically write `data` under `key`. Returns the final path.
    pub async fn put_bytes(&self, key: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(key)?;
        self.write_atomic(&path, data).await?;
        Ok(path)
    }

    /// Atomically write `data` at a raw relative path. Returns the final path.
    pub async fn put_bytes_raw(&self, rel: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.raw_path_for(rel)?;
        self.write_atomic(&path, data).await?;
        Ok(path)
    }

    /// Atomically copy the file at `src` under `key`. Returns the final path.
    pub async fn put_file(&self, key: &str, src: &Path) -> Result<PathBuf> {
        let path = self.path_for(key)?;
        let tmp = self.tmp_sibling(&path).await?;
        if let Err(e) = fs::copy(src, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::io(e, src, "copy"));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::io(e, &path, "rename"));
        }
        Ok(path)
    }

    /// Remove the entry for `key`, tolerating absence.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove")),
        }
    }

    async fn stat(&self, path: PathBuf) -> Result<Option<CacheFile>> {
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(CacheFile {
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "stat")),
        }
    }

    async fn read_path(&self, path: PathBuf) -> Result<Option<Vec<u8>>> {
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, &path, "read")),
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = self.tmp_sibling(path).await?;
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::io(e, &tmp, "write"));
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::io(e, path, "rename"));
        }
        Ok(())
    }

    /// Reserve a temporary sibling name next to `path`, creating parent
    /// directories. Renaming a sibling stays within one filesystem so the
    /// rename is atomic.
    async fn tmp_sibling(&self, path: &Path) -> Result<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::invalid_key(path.to_string_lossy()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        let seq = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        let name = format!(".tmp-{}-{seq}", std::process::id());
        Ok(parent.join(name))
    }

    /// Spawn the background pruner. Entries older than `ttl` are removed on
    /// an interval of `ttl / 4`, clamped to [1 minute, 1 hour]. The task
    /// exits when `shutdown` is cancelled.
    pub fn spawn_pruner(
        self: &Arc<Self>,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = (ttl / 4).clamp(Duration::from_secs(60), Duration::from_secs(3600));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a restart does not
            // race entries written moments before.
            tick.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Cache pruner stopping");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                let root = cache.root.clone();
                let result =
                    tokio::task::spawn_blocking(move || prune_once(&root, ttl)).await;
                match result {
                    Ok(stats) if stats.removed > 0 => {
                        debug!(
                            removed = stats.removed,
                            inspected = stats.inspected,
                            bytes = stats.bytes_reclaimed,
                            "Pruned expired cache entries"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Cache pruning pass panicked"),
                }
            }
        })
    }
}

fn segment_ok(seg: &str) -> bool {
    !seg.is_empty()
        && seg != "."
        && seg != ".."
        && seg.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'!' | b'@' | b'+' | b'~')
        })
}

/// One synchronous pruning pass: remove regular files under `root` whose
/// modification time is older than `max_age`, and opportunistically drop
/// shard directories that became empty. Concurrent writers are tolerated;
/// files that vanish mid-walk are skipped.
pub fn prune_once(root: &Path, max_age: Duration) -> PruneStats {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut stats = PruneStats::default();

    for entry in walkdir::WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if entry.file_type().is_dir() {
            if path != root {
                // Only succeeds when empty; failure is fine.
                let _ = std::fs::remove_dir(path);
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        stats.inspected += 1;
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff && std::fs::remove_file(path).is_ok() {
            stats.removed += 1;
            stats.bytes_reclaimed += meta.len();
        }
    }
    stats
}
