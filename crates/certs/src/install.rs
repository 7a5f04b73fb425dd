//! Best-effort installation of the CA into the OS trust store
//!
//! Failure here is non-fatal: callers log a warning and continue, since
//! clients can also trust the CA via explicit configuration (`SSL_CERT_FILE`
//! and friends).

use buildstash_core::{Error, Result};
use tracing::debug;

/// Install the PEM-encoded CA certificate into the system trust store.
///
/// Linux: drops the certificate into `/usr/local/share/ca-certificates` and
/// runs `update-ca-certificates`. macOS: adds it to the system keychain via
/// `security add-trusted-cert`. Other platforms are unsupported.
pub async fn install_system_cert(ca_pem: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let dest = std::path::Path::new("/usr/local/share/ca-certificates/buildstash-ca.crt");
        tokio::fs::write(dest, ca_pem)
            .await
            .map_err(|e| Error::io(e, dest, "write"))?;
        run_tool("update-ca-certificates", &[]).await?;
        debug!(path = %dest.display(), "Installed signing certificate in system store");
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        let tmp = std::env::temp_dir().join("buildstash-ca.pem");
        tokio::fs::write(&tmp, ca_pem)
            .await
            .map_err(|e| Error::io(e, &tmp, "write"))?;
        let tmp_str = tmp.to_string_lossy().to_string();
        let result = run_tool(
            "security",
            &[
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                "/Library/Keychains/System.keychain",
                &tmp_str,
            ],
        )
        .await;
        let _ = tokio::fs::remove_file(&tmp).await;
        result?;
        debug!("Installed signing certificate in system keychain");
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = ca_pem;
        Err(Error::configuration(
            "trust store installation is not supported on this platform",
        ))
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|e| Error::io_no_path(e, format!("spawn {program}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "{program} exited with {status}"
        )))
    }
}
