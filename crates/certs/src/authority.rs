//! CA generation and leaf issuance

use buildstash_core::{Error, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// CA and leaf validity window.
const CERT_LIFETIME: Duration = Duration::hours(24);

/// Backdating applied to `not_before` to absorb clock skew between the
/// server and its clients.
const NOT_BEFORE_SKEW: Duration = Duration::hours(1);

/// A leaf certificate issued for a specific set of hosts
pub struct LeafCert {
    /// PEM-encoded leaf certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// Ready-to-use TLS server configuration presenting this leaf
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Process-lifetime certificate authority
///
/// The signing certificate is regenerated at every startup and lives for 24
/// hours; leaves are memoized per host-set for the process lifetime.
pub struct CertAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    leaves: Mutex<HashMap<String, Arc<LeafCert>>>,
}

impl CertAuthority {
    /// Generate a fresh self-signed CA with the given subject organization.
    pub fn new(organization: &str) -> Result<Self> {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::tls(format!("generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization);
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{organization} CA"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + CERT_LIFETIME;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::tls(format!("self-sign CA: {e}")))?;

        debug!(organization, "Generated signing certificate");
        Ok(Self {
            ca_cert,
            ca_key,
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// PEM-encoded CA certificate, for trust-store installation and for
    /// clients that trust it via explicit configuration.
    #[must_use]
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Issue (or reuse) a leaf certificate whose subject alternative names
    /// are exactly `hosts`.
    pub fn issue(&self, hosts: &[String]) -> Result<Arc<LeafCert>> {
        let memo_key = hosts.join(",");
        {
            let leaves = self.leaves.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(leaf) = leaves.get(&memo_key) {
                return Ok(Arc::clone(leaf));
            }
        }

        // Mint outside the lock, then insert unless another request won the
        // race for the same host set.
        let leaf = Arc::new(self.mint(hosts)?);
        let mut leaves = self.leaves.lock().unwrap_or_else(|e| e.into_inner());
        let entry = leaves.entry(memo_key).or_insert_with(|| Arc::clone(&leaf));
        Ok(Arc::clone(entry))
    }

    fn mint(&self, hosts: &[String]) -> Result<LeafCert> {
        if hosts.is_empty() {
            return Err(Error::tls("cannot issue a leaf with no hosts"));
        }

        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::tls(format!("generate leaf key: {e}")))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, hosts[0].clone());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut sans = Vec::with_capacity(hosts.len());
        for host in hosts {
            if let Ok(addr) = host.parse::<IpAddr>() {
                sans.push(SanType::IpAddress(addr));
            } else {
                let name = host
                    .clone()
                    .try_into()
                    .map_err(|_| Error::tls(format!("invalid hostname: {host}")))?;
                sans.push(SanType::DnsName(name));
            }
        }
        params.subject_alt_names = sans;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + CERT_LIFETIME;

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| Error::tls(format!("sign leaf: {e}")))?;

        let chain: Vec<CertificateDer<'static>> =
            vec![cert.der().clone(), self.ca_cert.der().clone()];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .map_err(|e| Error::tls(format!("build server config: {e}")))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(hosts = ?hosts, "Issued leaf certificate");
        Ok(LeafCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            server_config: Arc::new(server_config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    // Multiple rustls-dependent crates in the dependency graph enable
    // different default crypto provider features, which makes rustls'
    // automatic provider detection ambiguous at test time. Install one
    // explicitly so `ServerConfig::builder()` doesn't panic.
    fn ensure_crypto_provider() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        });
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_ca_pem_shape() {
        let ca = CertAuthority::new("test build automation").unwrap();
        let pem = ca.ca_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(pem.contains("END CERTIFICATE"));
    }

    #[test]
    fn test_issue_leaf() {
        ensure_crypto_provider();
        let ca = CertAuthority::new("test").unwrap();
        let leaf = ca.issue(&hosts(&["origin.test"])).unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
        assert_eq!(leaf.server_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_leaf_memoization() {
        ensure_crypto_provider();
        let ca = CertAuthority::new("test").unwrap();
        let a = ca.issue(&hosts(&["origin.test", "alt.test"])).unwrap();
        let b = ca.issue(&hosts(&["origin.test", "alt.test"])).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = ca.issue(&hosts(&["other.test"])).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_ip_hosts_accepted() {
        ensure_crypto_provider();
        let ca = CertAuthority::new("test").unwrap();
        assert!(ca.issue(&hosts(&["127.0.0.1"])).is_ok());
    }

    #[test]
    fn test_empty_hosts_rejected() {
        let ca = CertAuthority::new("test").unwrap();
        assert!(ca.issue(&[]).is_err());
    }
}
