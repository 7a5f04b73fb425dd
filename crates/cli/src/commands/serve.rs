//! `serve` command: wire up the components and run until signaled
//!
//! Shutdown order once the token fires: the action server stops accepting
//! and drains its connections, the HTTP listener finishes in-flight
//! requests, the upload queue is flushed with a bounded grace, and the
//! pruner stops.

use crate::dispatcher::{self, AppState};
use crate::shutdown::cancel_on_signal;
use buildstash_action::{ActionCache, ActionCacheConfig, ActionServer};
use buildstash_certs::{install_system_cert, CertAuthority};
use buildstash_core::config::ServeConfig;
use buildstash_core::metrics::MetricsRegistry;
use buildstash_core::{Error, Result};
use buildstash_modproxy::{ModuleProxy, ModuleProxyConfig};
use buildstash_revproxy::{serve_inner, Bridge, RevProxy, RevProxyConfig};
use buildstash_store::{LocalCache, ObjectStore, S3Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Organization named in the generated signing certificate.
const CA_ORGANIZATION: &str = "buildstash build automation";

/// Run the cache server until SIGTERM/SIGINT.
pub async fn execute_serve(config: ServeConfig) -> Result<()> {
    config.validate().map_err(Error::configuration)?;

    let registry = Arc::new(MetricsRegistry::new());
    let local = Arc::new(LocalCache::new(&config.cache_dir).await?);
    info!(cache_dir = %config.cache_dir.display(), "Local cache directory");

    let store: Option<Arc<dyn ObjectStore>> = match &config.store {
        Some(store_config) => Some(Arc::new(S3Store::connect(store_config).await?)),
        None => {
            warn!("No object store configured; running with the local tier only");
            None
        }
    };
    let key_prefix = config
        .store
        .as_ref()
        .map(|s| s.key_prefix.clone())
        .unwrap_or_default();

    let shutdown_token = CancellationToken::new();
    cancel_on_signal(shutdown_token.clone());

    let pruner = if config.expiration_secs > 0 {
        info!(expiration_secs = config.expiration_secs, "Local cache pruning enabled");
        Some(local.spawn_pruner(
            Duration::from_secs(config.expiration_secs),
            shutdown_token.clone(),
        ))
    } else {
        None
    };

    // Action cache on the IPC endpoint.
    let cache = Arc::new(ActionCache::new(
        Arc::clone(&local),
        store.clone(),
        ActionCacheConfig {
            key_prefix: key_prefix.clone(),
            min_upload_size: config.min_upload_size,
            upload_concurrency: config.s3_concurrency,
            drain_grace: Duration::from_secs(30),
        },
        &registry,
    ));
    let server = Arc::new(ActionServer::new(
        Arc::clone(&cache),
        config.socket.clone(),
        config.concurrency,
        config.debug_log.buildcache,
        shutdown_token.clone(),
    ));
    let server_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    // Optional HTTP listener: module proxy, intercept proxy, debug handlers.
    let http_task = match &config.http {
        Some(addr) => {
            let mod_router = if config.modproxy {
                let proxy = ModuleProxy::new(
                    Arc::clone(&local),
                    store.clone(),
                    ModuleProxyConfig {
                        upstream: config.registry.clone(),
                        key_prefix: key_prefix.clone(),
                        sumdbs: config.sumdb.clone(),
                        latest_ttl: Duration::from_secs(config.latest_ttl_secs),
                        retry: Default::default(),
                        log_requests: config.debug_log.modproxy,
                    },
                    &registry,
                )?;
                info!(registry = %config.registry, "Module proxy enabled");
                Some(buildstash_modproxy::router(Arc::new(proxy)))
            } else {
                None
            };

            let bridge = if config.revproxy.is_empty() {
                None
            } else {
                let authority = CertAuthority::new(CA_ORGANIZATION)?;
                match install_system_cert(&authority.ca_pem()).await {
                    Ok(()) => info!("Installed signing certificate in system store"),
                    Err(e) => warn!(error = %e, "Could not install signing certificate"),
                }
                let proxy = Arc::new(RevProxy::new(
                    Arc::clone(&local),
                    store.clone(),
                    RevProxyConfig {
                        key_prefix: key_prefix.clone(),
                        retry: Default::default(),
                        log_requests: config.debug_log.revproxy,
                    },
                    &registry,
                )?);
                let (bridge, source) = Bridge::new(
                    Arc::clone(&proxy),
                    &authority,
                    config.revproxy.clone(),
                    &registry,
                )?;
                tokio::spawn(serve_inner(source, proxy, shutdown_token.clone()));
                Some(Arc::new(bridge))
            };

            let state = AppState {
                metrics: Arc::clone(&registry),
                config: Arc::new(config.redacted()),
                mod_router,
                bridge,
            };
            let app = dispatcher::router(state);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| Error::io_no_path(e, format!("bind {addr}")))?;
            info!(addr = %addr, "HTTP listener ready");
            let token = shutdown_token.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
            }))
        }
        None => None,
    };

    let mut server_task = server_task;
    let early_exit = tokio::select! {
        () = shutdown_token.cancelled() => {
            info!("Shutting down");
            None
        }
        // The action server only returns early on a startup failure such as
        // a socket bind error; treat that as fatal.
        result = &mut server_task => {
            shutdown_token.cancel();
            Some(result)
        }
    };
    let server_result = match early_exit {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => warn!(error = %e, "Action server task failed"),
    }
    if let Some(task) = http_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HTTP listener failed"),
            Err(e) => warn!(error = %e, "HTTP listener task failed"),
        }
    }
    if let Err(e) = cache.close().await {
        warn!(error = %e, "Upload drain incomplete");
    }
    if let Some(pruner) = pruner {
        let _ = pruner.await;
    }
    info!("Shutdown complete");
    Ok(())
}
