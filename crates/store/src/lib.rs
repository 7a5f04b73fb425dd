//! Two-tier storage for buildstash
//!
//! This crate provides the storage substrate every cache layer builds on:
//! - [`LocalCache`]: a content-addressed file store under a root directory,
//!   with atomic writes and TTL-based pruning
//! - [`ObjectStore`]: the S3-compatible shared tier, with an in-memory
//!   implementation for tests
//! - [`retry_with_backoff`]: exponential backoff for transient remote errors
//! - [`SingleFlight`]: coalescing of concurrent identical fetches
//!
//! The cache layers (action, module, reverse proxy) compose these with their
//! own key schemas; nothing in this crate knows what a key means.

mod local;
mod memory;
mod object;
mod retry;
mod singleflight;

pub use local::{prune_once, CacheFile, LocalCache, PruneStats};
pub use memory::MemoryStore;
pub use object::{ObjectStore, S3Store};
pub use retry::retry_with_backoff;
pub use singleflight::SingleFlight;
