//! CONNECT-hijacking bridge
//!
//! To the dispatcher the bridge is a request handler; to the inner proxy it
//! is a source of already-decrypted client connections. A CONNECT for an
//! intercepted host is answered with `200 OK`, the hijacked socket is
//! wrapped in a TLS server presenting a locally-signed leaf for the
//! intercept targets, and the resulting stream is pushed into an in-process
//! queue. [`serve_inner`] accepts from that queue and runs an HTTP/1
//! connection over each stream, feeding the plaintext requests to
//! [`RevProxy`]. CONNECT for any other host is tunneled through untouched;
//! one CONNECT yields exactly one TLS session.

use crate::proxy::{ProxyRequest, ProxyResponse, RevProxy};
use axum::body::Body;
use buildstash_certs::CertAuthority;
use buildstash_core::metrics::{Counter, MetricsRegistry};
use buildstash_core::{Error, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hijacked CONNECT streams queued for the inner server.
type TlsConn = tokio_rustls::server::TlsStream<TokioIo<hyper::upgrade::Upgraded>>;

/// Request bodies proxied through the bridge are buffered; anything larger
/// is refused.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Receiving end of the bridge's connection queue
pub struct ConnSource {
    rx: mpsc::Receiver<TlsConn>,
}

struct BridgeMetrics {
    hijacked: Arc<Counter>,
    tunneled: Arc<Counter>,
}

/// Outer CONNECT-hijacking bridge
pub struct Bridge {
    targets: HashSet<String>,
    proxy: Arc<RevProxy>,
    acceptor: TlsAcceptor,
    conns: mpsc::Sender<TlsConn>,
    metrics: BridgeMetrics,
}

impl Bridge {
    /// Create the bridge and the connection source for the inner server.
    ///
    /// One leaf certificate advertising every intercept target is issued up
    /// front; the hijacked TLS handshakes all terminate against it.
    pub fn new(
        proxy: Arc<RevProxy>,
        authority: &CertAuthority,
        targets: Vec<String>,
        registry: &MetricsRegistry,
    ) -> Result<(Self, ConnSource)> {
        if targets.is_empty() {
            return Err(Error::configuration(
                "the intercept proxy needs at least one target host",
            ));
        }
        let leaf = authority.issue(&targets)?;
        let (tx, rx) = mpsc::channel(64);
        info!(targets = ?targets, "Intercept proxy enabled");
        Ok((
            Self {
                targets: targets.into_iter().collect(),
                proxy,
                acceptor: TlsAcceptor::from(Arc::clone(&leaf.server_config)),
                conns: tx,
                metrics: BridgeMetrics {
                    hijacked: registry.counter("revproxy.connect.hijacked"),
                    tunneled: registry.counter("revproxy.connect.tunneled"),
                },
            },
            ConnSource { rx },
        ))
    }

    /// Handle a proxy-form request routed here by the dispatcher.
    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        if request.method() == Method::CONNECT {
            return self.handle_connect(request);
        }
        self.handle_plain(request).await
    }

    /// CONNECT: hijack intercepted hosts, tunnel everything else.
    fn handle_connect(&self, request: Request<Body>) -> Response<Body> {
        let Some(authority) = request.uri().authority().cloned() else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let host = authority.host().to_string();

        if self.targets.contains(&host) {
            self.metrics.hijacked.incr();
            let acceptor = self.acceptor.clone();
            let conns = self.conns.clone();
            tokio::spawn(async move {
                let upgraded = match hyper::upgrade::on(request).await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        debug!(host = %host, error = %e, "CONNECT upgrade failed");
                        return;
                    }
                };
                match acceptor.accept(TokioIo::new(upgraded)).await {
                    Ok(tls) => {
                        if conns.send(tls).await.is_err() {
                            debug!(host = %host, "Inner server gone, dropping connection");
                        }
                    }
                    Err(e) => debug!(host = %host, error = %e, "TLS handshake failed"),
                }
            });
            return status_response(StatusCode::OK);
        }

        // Not intercepted: transparent tunnel to the real origin.
        self.metrics.tunneled.incr();
        let port = authority.port_u16().unwrap_or(443);
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(request).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!(host = %host, error = %e, "CONNECT upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(mut origin) => {
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client, &mut origin).await
                    {
                        debug!(host = %host, error = %e, "Tunnel closed with error");
                    }
                }
                Err(e) => warn!(host = %host, port, error = %e, "Tunnel connect failed"),
            }
        });
        status_response(StatusCode::OK)
    }

    /// Plain proxy-form request: cached path for intercepted hosts,
    /// uncached pass-through for the rest.
    async fn handle_plain(&self, request: Request<Body>) -> Response<Body> {
        let Some(host) = request.uri().host().map(str::to_string) else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        let url = request.uri().to_string();
        let method = request.method().clone();
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(_) => return status_response(StatusCode::PAYLOAD_TOO_LARGE),
        };

        let proxy_request = ProxyRequest {
            method,
            url,
            headers: parts.headers,
            body,
        };
        let result = if self.targets.contains(&host) {
            self.proxy.handle(proxy_request).await
        } else {
            self.proxy.passthrough(proxy_request).await
        };
        match result {
            Ok(response) => axum_response(response),
            Err(e) => {
                debug!(host = %host, error = %e, "Proxy request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

/// Accept decrypted connections from the bridge and serve each with an
/// HTTP/1 connection wired to the inner proxy. The inner server listens on
/// no real port; this queue is its listener.
pub async fn serve_inner(
    mut source: ConnSource,
    proxy: Arc<RevProxy>,
    shutdown: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            conn = source.rx.recv() => conn,
            () = shutdown.cancelled() => break,
        };
        let Some(tls) = conn else { break };
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                let proxy = Arc::clone(&proxy);
                async move { serve_decrypted(&proxy, request).await }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(error = %e, "Hijacked connection ended with error");
            }
        });
    }
    debug!("Inner proxy server stopped");
}

/// One plaintext request from a hijacked TLS session. The URI is in
/// origin-form; the absolute URL is reassembled from the Host header, with
/// the https scheme the client believes it is speaking.
async fn serve_decrypted(
    proxy: &RevProxy,
    request: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let Some(host) = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Ok(full_status(StatusCode::BAD_REQUEST));
    };
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let url = format!("https://{host}{path_and_query}");
    let method = request.method().clone();

    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return Ok(full_status(StatusCode::BAD_REQUEST));
        }
    };

    let result = proxy
        .handle(ProxyRequest {
            method,
            url,
            headers: parts.headers,
            body,
        })
        .await;
    match result {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = response.headers;
            }
            Ok(builder
                .body(Full::new(response.body))
                .unwrap_or_else(|_| full_status(StatusCode::INTERNAL_SERVER_ERROR)))
        }
        Err(e) => {
            debug!(error = %e, "Proxy request failed");
            Ok(full_status(StatusCode::BAD_GATEWAY))
        }
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn full_status(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn axum_response(response: ProxyResponse) -> Response<Body> {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}
