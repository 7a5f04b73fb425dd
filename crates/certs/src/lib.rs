//! On-demand TLS certificate authority
//!
//! At startup the server generates a short-lived CA and (best-effort)
//! installs it into the OS trust store. The intercept bridge then asks for
//! per-host leaf certificates to impersonate origin servers when terminating
//! hijacked CONNECT streams.

mod authority;
mod install;

pub use authority::{CertAuthority, LeafCert};
pub use install::install_system_cert;
