//! In-memory object store for tests and outage simulation

use crate::ObjectStore;
use async_trait::async_trait;
use buildstash_core::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

/// Object store held entirely in memory.
///
/// Used by tests that need to observe traffic (put/get counters) or simulate
/// a remote outage (`set_available(false)` makes every call fail with a
/// retryable error).
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    available: AtomicBool,
    gets: AtomicU64,
    puts: AtomicU64,
    heads: AtomicU64,
}

impl MemoryStore {
    /// Create an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Toggle availability; when unavailable every operation fails with a
    /// retryable remote error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether an object exists at `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Total `get` calls observed (including misses and failures).
    #[must_use]
    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Total `put`/`put_file` calls observed.
    #[must_use]
    pub fn put_calls(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Total `head` calls observed.
    #[must_use]
    pub fn head_calls(&self) -> u64 {
        self.heads.load(Ordering::Relaxed)
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::remote(operation, "store unavailable"))
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.check_available("GetObject")?;
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.check_available("PutObject")?;
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.check_available("PutObject")?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(e, path, "read"))?;
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        self.heads.fetch_add(1, Ordering::Relaxed);
        self.check_available("HeadObject")?;
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|b| b.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_counters() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), "v");
        assert_eq!(store.head("k").await.unwrap(), Some(1));

        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.put_calls(), 1);
        assert_eq!(store.head_calls(), 1);
    }

    #[tokio::test]
    async fn test_outage() {
        let store = MemoryStore::new();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();

        store.set_available(false);
        assert!(store.get("k").await.unwrap_err().is_retryable());
        assert!(store.put("k2", Bytes::new()).await.is_err());

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().unwrap(), "v");
    }
}
