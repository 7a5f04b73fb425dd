//! Stdio bridge to a running cache server
//!
//! The compiler spawns this process and speaks the cache protocol on
//! stdin/stdout; the bridge relays the byte stream to the server's Unix
//! socket in both directions and exits when either side closes.

use buildstash_core::{Error, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::debug;

/// Relay stdin/stdout to the Unix socket at `socket`.
pub async fn run_stdio_bridge(socket: &Path) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Error::io(e, socket, "connect"))?;
    debug!(socket = %socket.display(), "Connected to cache server");

    let (mut server_read, mut server_write) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let to_server = async {
        let n = tokio::io::copy(&mut stdin, &mut server_write).await?;
        // Propagate our EOF so the server sees a clean close.
        server_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let to_client = async {
        let n = tokio::io::copy(&mut server_read, &mut stdout).await?;
        stdout.flush().await?;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(to_server, to_client)
        .map_err(|e| Error::io_no_path(e, "relay"))?;
    debug!(sent, received, "Bridge closed");
    Ok(())
}
