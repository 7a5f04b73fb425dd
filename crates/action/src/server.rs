//! Unix-socket server for the action-cache protocol
//!
//! One connection per compiler worker; requests on a connection are handled
//! in order, with a server-wide semaphore bounding how many are active at
//! once. Shutdown stops the accept loop, answers further requests with an
//! error frame, and drains live connections for a short grace period.

use crate::cache::ActionCache;
use crate::protocol::{read_frame, write_frame, FrameError, Request, Response};
use buildstash_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period for live connections after shutdown begins.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Action-cache IPC server
pub struct ActionServer {
    cache: Arc<ActionCache>,
    socket: PathBuf,
    limiter: Arc<Semaphore>,
    log_requests: bool,
    shutdown: CancellationToken,
}

impl ActionServer {
    /// Create a server for `cache` listening on `socket`.
    pub fn new(
        cache: Arc<ActionCache>,
        socket: PathBuf,
        max_requests: usize,
        log_requests: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            socket,
            limiter: Arc::new(Semaphore::new(max_requests.max(1))),
            log_requests,
            shutdown,
        }
    }

    /// Run until the shutdown token fires, then drain connections.
    pub async fn run(&self) -> Result<()> {
        if let Some(parent) = self.socket.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        // Remove a stale socket from a previous process.
        let _ = tokio::fs::remove_file(&self.socket).await;

        let listener =
            UnixListener::bind(&self.socket).map_err(|e| Error::io(e, &self.socket, "bind"))?;
        info!(socket = %self.socket.display(), "Action cache listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let cache = Arc::clone(&self.cache);
                            let limiter = Arc::clone(&self.limiter);
                            let token = self.shutdown.clone();
                            let log_requests = self.log_requests;
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_client(stream, cache, limiter, token, log_requests).await
                                {
                                    debug!(error = %e, "Client connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
                () = self.shutdown.cancelled() => break,
            }
        }

        debug!(live = connections.len(), "Draining action-cache connections");
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = connections.len(), "Connection drain grace expired");
            connections.abort_all();
        }

        let _ = tokio::fs::remove_file(&self.socket).await;
        info!("Action cache stopped");
        Ok(())
    }
}

async fn handle_client(
    stream: UnixStream,
    cache: Arc<ActionCache>,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    log_requests: bool,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request = match read_frame::<_, Request>(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.is_eof() => return Ok(()),
            Err(FrameError::Decode(e)) => {
                // The payload was consumed; the stream is still framed, so
                // report the error and keep the connection open.
                let resp = Response::Error {
                    message: format!("malformed request: {e}"),
                };
                write_frame(&mut writer, &resp).await?;
                continue;
            }
            Err(FrameError::TooLarge(len)) => {
                // Unsynchronized stream: report and hang up.
                let resp = Response::Error {
                    message: format!("frame of {len} bytes exceeds limit"),
                };
                write_frame(&mut writer, &resp).await?;
                return Ok(());
            }
            Err(FrameError::Io(e)) => return Err(e),
        };

        if shutdown.is_cancelled() && !matches!(request, Request::Close) {
            let resp = Response::Error {
                message: "shutting down".into(),
            };
            write_frame(&mut writer, &resp).await?;
            continue;
        }

        let response = {
            let _permit = limiter.acquire().await;
            dispatch(&cache, &request, log_requests).await
        };
        let closing = matches!(request, Request::Close);
        write_frame(&mut writer, &response).await?;
        if closing {
            return Ok(());
        }
    }
}

async fn dispatch(cache: &ActionCache, request: &Request, log_requests: bool) -> Response {
    match request {
        Request::Get { action } => {
            let result = cache.get(action).await;
            if log_requests {
                debug!(action = %action, hit = matches!(result, Ok(Some(_))), "get");
            }
            match result {
                Ok(Some(hit)) => Response::Hit {
                    output: hit.output,
                    disk_path: hit.disk_path,
                    size: hit.size,
                },
                Ok(None) => Response::Miss,
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Put {
            action,
            output,
            body_path,
            size,
        } => {
            if log_requests {
                debug!(action = %action, output = %output, size, "put");
            }
            match cache.put(action, output, body_path, *size).await {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            }
        }
        Request::Close => Response::Ack,
    }
}
