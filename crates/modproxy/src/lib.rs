//! Module-registry caching proxy
//!
//! Serves module artifacts (`/<module>/@v/<version>.{info,mod,zip}`,
//! `/<module>/@latest`) and checksum-database lookups through the same
//! two-tier storage discipline as the action cache, keyed by canonical
//! registry paths instead of content fingerprints. Artifacts are immutable
//! and mirrored to the object store; `@latest` is mutable, lives only in the
//! local tier, and is revalidated upstream after a short TTL.

mod cache;
mod http;
mod path;

pub use cache::{ModResponse, ModuleProxy, ModuleProxyConfig};
pub use http::router;
pub use path::{escape_path, ArtifactKind, ModRequest};
