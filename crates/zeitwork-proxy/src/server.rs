use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::routes::{Route, RouteTable};
use crate::tls::StoreCertResolver;

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type HttpClient = Client<HttpConnector, Incoming>;

/// Shared state of one edge proxy instance.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub routes: Arc<RouteTable>,
    pub client: HttpClient,
}

impl ProxyState {
    pub fn new(config: ProxyConfig, routes: Arc<RouteTable>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routes,
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }
}

fn full_body(text: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

/// Strip an optional port from a Host header value.
pub fn host_without_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Handle one request. `outermost` is true on the TLS edge; a
/// peer-forwarded request only ever serves local VMs so a stale peer table
/// cannot bounce traffic in a cycle.
pub async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    outermost: bool,
) -> Result<Response<ProxyBody>> {
    let Some(host) = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(host_without_port)
        .map(str::to_string)
    else {
        return Ok(Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body("Missing Host header"))?);
    };

    // One consistent snapshot per request.
    let Some(route) = state.routes.lookup(&host).await else {
        debug!(host = %host, "No route for host");
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body("Service Not Found"))?);
    };

    if route.is_local {
        forward(state, req, &route, route.vm_addr).await
    } else if outermost {
        // Plaintext hop to the owning server's peer proxy, Host preserved.
        forward(state, req, &route, route.peer_addr).await
    } else {
        warn!(host = %host, "Peer-forwarded request for a non-local VM");
        Ok(Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(full_body("Route moved"))?)
    }
}

async fn forward(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    route: &Route,
    target: std::net::SocketAddr,
) -> Result<Response<ProxyBody>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: hyper::Uri = format!("http://{}{}", target, path_and_query)
        .parse()
        .with_context(|| "Failed to build upstream URI")?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    // Hop-by-hop headers do not cross the proxy.
    parts.headers.remove(hyper::header::CONNECTION);

    let upstream = Request::from_parts(parts, body);
    match state.client.request(upstream).await {
        Ok(response) => {
            debug!(
                host = %route.hostname,
                target = %target,
                status = %response.status(),
                "Proxied request"
            );
            Ok(response.map(|b| b.boxed()))
        }
        Err(e) => {
            warn!(host = %route.hostname, target = %target, error = %e, "Upstream unreachable");
            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(full_body("Upstream unreachable"))?)
        }
    }
}

/// TLS edge listener: terminate, then serve requests as outermost.
pub async fn serve_tls(
    state: Arc<ProxyState>,
    resolver: Arc<StoreCertResolver>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(state.config.https_addr)
        .await
        .with_context(|| format!("Failed to bind TLS listener on {}", state.config.https_addr))?;
    let acceptor = tokio_rustls::TlsAcceptor::from(crate::tls::server_config(resolver));
    info!(listen = %state.config.https_addr, "Edge TLS listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "TLS accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = service_fn(move |req| handle(Arc::clone(&state), req, true));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Edge connection ended");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("Edge TLS listener stopping");
                return Ok(());
            }
        }
    }
}

/// Plaintext peer listener on the internal network.
pub async fn serve_peer(state: Arc<ProxyState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(state.config.peer_addr)
        .await
        .with_context(|| format!("Failed to bind peer listener on {}", state.config.peer_addr))?;
    info!(listen = %state.config.peer_addr, "Peer listener ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Peer accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(Arc::clone(&state), req, false));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Peer connection ended");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("Peer listener stopping");
                return Ok(());
            }
        }
    }
}
