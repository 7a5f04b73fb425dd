//! HTTPS-intercepting caching reverse proxy
//!
//! Two collaborating halves:
//!
//! - The *inner* proxy ([`RevProxy`]) checks its two-tier cache, forwards
//!   cacheable GETs to the origin when necessary, and records responses.
//! - The *outer* bridge ([`Bridge`]) receives proxy-form requests from the
//!   dispatcher. Plain HTTP requests go straight to the inner handler; a
//!   CONNECT for an intercepted host is hijacked, TLS is terminated with a
//!   locally-signed leaf, and the decrypted stream is pushed into an
//!   in-process connection queue that the inner server accepts from. CONNECT
//!   for any other host is tunneled to the real origin untouched.

mod bridge;
mod proxy;

pub use bridge::{serve_inner, Bridge, ConnSource};
pub use proxy::{ProxyRequest, ProxyResponse, RevProxy, RevProxyConfig};
