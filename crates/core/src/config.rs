//! Configuration types for the cache server
//!
//! These structs are populated from CLI flags by the binary crate and handed
//! to the components at construction. A redacted snapshot is served at
//! `/debug/config`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the S3-compatible object store tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Bucket name
    pub bucket: String,

    /// AWS region
    pub region: String,

    /// Optional endpoint URL override (MinIO, Ceph, localstack, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Use path-style addressing instead of virtual-host addressing
    #[serde(default)]
    pub path_style: bool,

    /// Key prefix prepended to every object key
    #[serde(default)]
    pub key_prefix: String,

    /// Retry configuration for remote operations
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Per-component request-logging toggles, parsed from `--debug-log`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugLog {
    /// Log action-cache requests
    pub buildcache: bool,
    /// Log module-proxy requests
    pub modproxy: bool,
    /// Log reverse-proxy requests
    pub revproxy: bool,
}

impl DebugLog {
    /// Parse a comma-separated component list, e.g. `buildcache,revproxy`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut out = Self::default();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "buildcache" => out.buildcache = true,
                "modproxy" => out.modproxy = true,
                "revproxy" => out.revproxy = true,
                other => return Err(format!("unknown debug-log component: {other}")),
            }
        }
        Ok(out)
    }
}

/// Full configuration for the `serve` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Root directory of the local cache tier
    pub cache_dir: PathBuf,

    /// Unix socket path for the action-cache IPC endpoint
    pub socket: PathBuf,

    /// Object store configuration; `None` disables the remote tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    /// Maximum simultaneously active action-cache requests
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum simultaneous object-store uploads
    #[serde(default = "default_s3_concurrency")]
    pub s3_concurrency: usize,

    /// Output blobs smaller than this are never uploaded (bytes)
    #[serde(default = "default_min_upload_size")]
    pub min_upload_size: u64,

    /// Local cache entry lifetime in seconds; 0 disables pruning
    #[serde(default)]
    pub expiration_secs: u64,

    /// HTTP listen address; `None` disables the HTTP listener
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    /// Enable the module-registry proxy (requires `http`)
    #[serde(default)]
    pub modproxy: bool,

    /// Upstream module registry URL
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Hosts served by the intercepting reverse proxy; empty disables it
    #[serde(default)]
    pub revproxy: Vec<String>,

    /// Allowlisted checksum databases for `/lookup` proxying
    #[serde(default = "default_sumdb")]
    pub sumdb: Vec<String>,

    /// Local TTL for mutable module endpoints (`@latest`) in seconds
    #[serde(default = "default_latest_ttl_secs")]
    pub latest_ttl_secs: u64,

    /// Per-component request logging
    #[serde(default)]
    pub debug_log: DebugLog,
}

impl ServeConfig {
    /// Validate cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err("you must provide a --cache-dir".into());
        }
        if self.modproxy && self.http.is_none() {
            return Err("you must set --http to enable --modproxy".into());
        }
        if !self.revproxy.is_empty() && self.http.is_none() {
            return Err("you must set --http to enable --revproxy".into());
        }
        if self.concurrency == 0 {
            return Err("--concurrency must be at least 1".into());
        }
        if self.s3_concurrency == 0 {
            return Err("--s3-concurrency must be at least 1".into());
        }
        Ok(())
    }

    /// Snapshot safe to expose on `/debug/config`.
    ///
    /// Everything here is already non-secret (credentials come from the
    /// ambient AWS environment), so this is a straight serialization.
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// Default value functions

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_concurrency() -> usize {
    64
}

fn default_s3_concurrency() -> usize {
    16
}

fn default_min_upload_size() -> u64 {
    0
}

fn default_registry() -> String {
    "https://proxy.golang.org".to_string()
}

fn default_sumdb() -> Vec<String> {
    vec!["sum.golang.org".to_string()]
}

fn default_latest_ttl_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServeConfig {
        ServeConfig {
            cache_dir: PathBuf::from("/tmp/cache"),
            socket: PathBuf::from("/tmp/cache/buildstash.sock"),
            store: None,
            concurrency: default_concurrency(),
            s3_concurrency: default_s3_concurrency(),
            min_upload_size: 0,
            expiration_secs: 0,
            http: None,
            modproxy: false,
            registry: default_registry(),
            revproxy: Vec::new(),
            sumdb: default_sumdb(),
            latest_ttl_secs: default_latest_ttl_secs(),
            debug_log: DebugLog::default(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_modproxy_requires_http() {
        let mut cfg = base_config();
        cfg.modproxy = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("--http"));
    }

    #[test]
    fn test_revproxy_requires_http() {
        let mut cfg = base_config();
        cfg.revproxy = vec!["origin.test".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_debug_log_parse() {
        let dl = DebugLog::parse("buildcache,revproxy").unwrap();
        assert!(dl.buildcache);
        assert!(!dl.modproxy);
        assert!(dl.revproxy);

        assert!(DebugLog::parse("").unwrap() == DebugLog::default());
        assert!(DebugLog::parse("bogus").is_err());
    }

    #[test]
    fn test_retry_config_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_redacted_is_serializable() {
        let cfg = base_config();
        let value = cfg.redacted();
        assert_eq!(value["concurrency"], 64);
        assert!(value.get("store").is_none());
    }
}
