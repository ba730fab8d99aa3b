use crate::admission::{Admission, AdmissionControl};
use crate::error::{empty_body, json_error_response, GatewayBody, ProxyErrorCode};
use crate::forward::{ForwardRequest, Forwarder};
use crate::multipart;
use crate::pool::{PoolError, ProxyLease, ProxyPool};
use crate::request_log::Exchange;
use crate::upstream::{Upstream, UpstreamKind, UpstreamSet};
use crate::websocket;
use futures::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Headers consulted, in order, when forwarded headers are trusted
const FORWARDED_IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "cf-connecting-ip",
    "fastly-client-ip",
    "x-real-ip",
];

const CORS_HEADERS: &[(&str, &str)] = &[
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, PUT, DELETE, OPTIONS"),
    (
        "access-control-allow-headers",
        "Content-Type, X-API-Key, Anthropic-Version, Anthropic-Beta, Authorization, OpenAI-Beta",
    ),
    ("access-control-max-age", "86400"),
];

/// Shared state behind every connection
#[derive(Debug)]
pub struct Gateway {
    pub admission: Arc<AdmissionControl>,
    pub pool: Arc<ProxyPool>,
    pub upstreams: UpstreamSet,
    pub forwarder: Forwarder,
    /// Resolve the source address from forwarding headers
    pub trust_forwarded_headers: bool,
    pub cors: bool,
}

/// The gateway listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(serve(gateway, req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Run the request handler, turning a panic into a 500 for this request only
async fn serve(gateway: Arc<Gateway>, req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
    let cors = gateway.cors;
    let mut response = match AssertUnwindSafe(handle_request(&gateway, req, peer))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(peer = %peer, panic = %message, "Request handler panicked");
            json_error_response(ProxyErrorCode::InternalError, "Internal server error")
        }
    };

    if cors {
        apply_cors(response.headers_mut());
    }
    response
}

async fn handle_request(gateway: &Gateway, req: Request<Incoming>, peer: SocketAddr) -> Response<GatewayBody> {
    if req.method() == Method::OPTIONS && gateway.cors {
        return preflight_response();
    }

    let source_ip = resolve_source_ip(req.headers(), peer, gateway.trust_forwarded_headers);

    let admission = gateway.admission.check(&source_ip);
    if let Some(code) = admission.rejection() {
        warn!(source_ip = %source_ip, outcome = ?admission, "Request rejected by admission control");
        let message = match admission {
            Admission::Blacklisted => "Access denied",
            _ => "Too many requests, please try again later",
        };
        return json_error_response(code, message);
    }

    let Some(hostname) = extract_hostname(&req) else {
        return json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        );
    };

    let Some(upstream) = gateway.upstreams.route(&hostname).cloned() else {
        return json_error_response(ProxyErrorCode::UnsupportedApi, "Unsupported API");
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    debug!(
        source_ip = %source_ip,
        upstream = upstream.kind.name(),
        method = %req.method(),
        path = %path_and_query,
        "Incoming request"
    );

    if let Err(failed) = upstream.kind.check_preconditions(req.uri().path(), req.headers()) {
        warn!(source_ip = %source_ip, error_type = failed.error_type(), "Request failed protocol precondition");
        gateway.admission.record_error(&source_ip, failed.error_type());
        return json_error_response(failed.code(), failed.message());
    }

    if websocket::is_upgrade_request(req.headers()) {
        let lease = match acquire(gateway).await {
            Ok(lease) => lease,
            Err(response) => return response,
        };
        let exchange = exchange_for(&source_ip, &upstream, req.method(), &path_and_query, &lease);
        return websocket::relay_upgrade(req, upstream, exchange, lease, gateway.forwarder.log().clone()).await;
    }

    if upstream.kind == UpstreamKind::OpenAi && multipart::is_multipart(req.headers()) {
        let lease = match acquire(gateway).await {
            Ok(lease) => lease,
            Err(response) => return response,
        };
        let exchange = exchange_for(&source_ip, &upstream, req.method(), &path_and_query, &lease);
        return multipart::relay_multipart(req, upstream, exchange, lease, &gateway.forwarder).await;
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(source_ip = %source_ip, error = %e, "Failed to read request body");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to read request body");
        }
    };

    let params = match upstream.kind.parse_params(&parts.method, &parts.headers, &body) {
        Ok(params) => params,
        Err(code) => {
            let message = match code {
                ProxyErrorCode::EmptyBody => "Request body is empty",
                _ => "Invalid JSON body",
            };
            return json_error_response(code, message);
        }
    };

    let lease = match acquire(gateway).await {
        Ok(lease) => lease,
        Err(response) => return response,
    };
    let exchange = exchange_for(&source_ip, &upstream, &parts.method, &path_and_query, &lease)
        .with_params(params);

    let request = ForwardRequest {
        upstream,
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    };
    gateway.forwarder.forward(request, exchange, lease).await
}

async fn acquire(gateway: &Gateway) -> Result<ProxyLease, Response<GatewayBody>> {
    gateway.pool.lease().await.map_err(|e| match e {
        PoolError::NoProxiesAvailable => {
            warn!("No egress proxies available");
            json_error_response(ProxyErrorCode::NoProxiesAvailable, "No proxies available")
        }
    })
}

fn exchange_for(
    source_ip: &str,
    upstream: &Upstream,
    method: &Method,
    path_and_query: &str,
    lease: &ProxyLease,
) -> Exchange {
    Exchange::start(
        source_ip,
        upstream.kind.name(),
        method.as_str(),
        path_and_query,
        lease.proxy(),
    )
}

/// Longest hostname DNS allows
const MAX_HOSTNAME_LEN: usize = 253;

/// Lower-cased hostname from the Host header (or the URI authority for
/// HTTP/2), port stripped. `None` if absent or not a plausible hostname.
pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = host.split(':').next()?;
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// The address admission control and error recording key on
pub fn resolve_source_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = FORWARDED_IP_HEADERS.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        });
        if let Some(ip) = forwarded {
            return ip.strip_prefix("::ffff:").unwrap_or(ip).to_string();
        }
    }

    match peer.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in CORS_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

fn preflight_response() -> Response<GatewayBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &'static str) -> Request<()> {
        Request::builder()
            .uri("/v1/messages")
            .header("host", host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname(&request_with_host("Claude.API.example.com:6543")),
            Some("claude.api.example.com".to_string())
        );
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host("evil\\host")), None);
        assert_eq!(extract_hostname(&request_with_host(":80")), None);

        let long = Box::leak(format!("{}.com", "a".repeat(260)).into_boxed_str());
        assert_eq!(extract_hostname(&request_with_host(long)), None);
    }

    #[test]
    fn test_extract_hostname_from_authority() {
        let req = Request::builder()
            .uri("http://openai.api.example.com/v1/models")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req), Some("openai.api.example.com".to_string()));

        let req = Request::builder().uri("/v1/models").body(()).unwrap();
        assert_eq!(extract_hostname(&req), None);
    }

    #[test]
    fn test_source_ip_from_peer() {
        let peer: SocketAddr = "[::ffff:192.0.2.7]:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));

        assert_eq!(resolve_source_ip(&headers, peer, false), "192.0.2.7");

        let peer: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        assert_eq!(resolve_source_ip(&HeaderMap::new(), peer, false), "2001:db8::1");
    }

    #[test]
    fn test_source_ip_from_trusted_headers() {
        let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(resolve_source_ip(&headers, peer, true), "203.0.113.9");

        let mut headers = HeaderMap::new();
        headers.insert("cf-connecting-ip", HeaderValue::from_static("::ffff:198.51.100.4"));
        assert_eq!(resolve_source_ip(&headers, peer, true), "198.51.100.4");

        assert_eq!(resolve_source_ip(&HeaderMap::new(), peer, true), "10.0.0.2");
    }

    #[test]
    fn test_cors_headers() {
        let mut response = preflight_response();
        apply_cors(response.headers_mut());

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(response.headers().get("access-control-max-age").unwrap(), "86400");
        assert!(response
            .headers()
            .get("access-control-allow-headers")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("X-API-Key"));
    }
}
