//! Signal-driven shutdown
//!
//! Everything in the tree drains off one `CancellationToken` (the action
//! server, the pruner, the inner proxy loop, axum's graceful shutdown), so
//! the signal handler just cancels that token.

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `shutdown` when SIGTERM or SIGINT arrives.
pub fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        shutdown.cancel();
    });
}
