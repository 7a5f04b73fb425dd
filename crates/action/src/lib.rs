//! Compile-action cache
//!
//! The primary path of the cache server: compiler workers hand over
//! `(action fingerprint, output fingerprint, artifact)` triples and ask them
//! back by action fingerprint. Entries live in the local disk tier for
//! low-latency reuse within one worker's lifetime and are promoted in the
//! background to the shared object store for fleet-wide reuse.
//!
//! The cache is served on a Unix-domain socket speaking a length-prefixed
//! JSON protocol; [`client::run_stdio_bridge`] lets a compiler child process
//! reach a long-lived server through stdio.

pub mod cache;
pub mod client;
pub mod protocol;
pub mod server;

pub use cache::{ActionCache, ActionCacheConfig, ActionEntry, ActionHit};
pub use server::ActionServer;
