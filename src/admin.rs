use crate::pool::ProxyPool;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = response(status, body);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Public addresses clients are told to use
#[derive(Debug, Clone)]
pub struct AdvertisedEndpoints {
    pub openai: String,
    pub claude: String,
}

impl AdvertisedEndpoints {
    pub fn new(public_domain: &str, port: u16) -> Self {
        Self {
            openai: format!("http://openai.api.{}:{}", public_domain, port),
            claude: format!("http://claude.api.{}:{}", public_domain, port),
        }
    }
}

/// Loopback stats server
pub struct AdminServer {
    bind_addr: SocketAddr,
    pool: Arc<ProxyPool>,
    endpoints: Arc<AdvertisedEndpoints>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        pool: Arc<ProxyPool>,
        endpoints: AdvertisedEndpoints,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            pool,
            endpoints: Arc::new(endpoints),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Stats server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let endpoints = Arc::clone(&self.endpoints);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, pool, endpoints).await {
                                    debug!(addr = %addr, error = %e, "Stats connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept stats connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Stats server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    pool: Arc<ProxyPool>,
    endpoints: Arc<AdvertisedEndpoints>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let pool = Arc::clone(&pool);
        let endpoints = Arc::clone(&endpoints);
        async move { Ok::<_, Infallible>(handle_admin_request(&req, &pool, &endpoints)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Stats connection error: {}", e))?;

    Ok(())
}

fn handle_admin_request<B>(
    req: &Request<B>,
    pool: &ProxyPool,
    endpoints: &AdvertisedEndpoints,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Stats request");

    match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/api/proxy-status") => {
            let stats = pool.stats();
            let body = serde_json::json!({
                "totalProxies": stats.total,
                "activeProxies": stats.active_count,
                "currentConcurrency": stats.current_concurrency,
                "openaiProxyAddress": endpoints.openai,
                "claudeProxyAddress": endpoints.claude,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"Not Found"}"#),
    }
}
