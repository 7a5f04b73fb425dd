//! `connect` command: stdio bridge to a running server

use buildstash_core::Result;
use std::path::Path;

/// Relay stdin/stdout to the server socket until either side closes.
pub async fn execute_connect(socket: &Path) -> Result<()> {
    buildstash_action::client::run_stdio_bridge(socket).await
}
