//! Raw connections to an upstream through an egress proxy
//!
//! Opens a TCP connection to the proxy, asks it to `CONNECT` to the upstream
//! and, for https upstreams, runs a rustls client handshake over the tunnel.

use crate::upstream::Upstream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Largest response head accepted from a proxy or upstream
const MAX_HEAD_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to proxy {proxy}: {source}")]
    Connect {
        proxy: String,
        source: std::io::Error,
    },
    #[error("proxy refused CONNECT with status {0}")]
    Refused(u16),
    #[error("malformed response head")]
    MalformedResponse,
    #[error("response head too large")]
    HeadTooLarge,
    #[error("connection closed before response head completed")]
    UnexpectedEof,
    #[error("invalid TLS server name {0}")]
    ServerName(String),
    #[error("TLS setup failed: {0}")]
    TlsConfig(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional byte stream, plain or TLS
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Establish a `CONNECT` tunnel to `authority` through `proxy`
pub async fn connect_via_proxy(proxy: &str, authority: &str) -> Result<TcpStream, TunnelError> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .map_err(|source| TunnelError::Connect {
            proxy: proxy.to_string(),
            source,
        })?;

    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let (head, _) = read_response_head(&mut stream).await?;
    let status = parse_status(&head).ok_or(TunnelError::MalformedResponse)?;
    if !(200..300).contains(&status) {
        return Err(TunnelError::Refused(status));
    }

    debug!(proxy, authority, "CONNECT tunnel established");
    Ok(stream)
}

/// Open a connection to `upstream` through `proxy`, with TLS when the
/// upstream scheme is https
pub async fn open(proxy: &str, upstream: &Upstream) -> Result<BoxedStream, TunnelError> {
    let authority = format!("{}:{}", upstream.config.host, upstream.config.port());
    let stream = connect_via_proxy(proxy, &authority).await?;

    if !upstream.is_tls() {
        return Ok(Box::new(stream));
    }

    let server_name = ServerName::try_from(upstream.config.host.clone())
        .map_err(|_| TunnelError::ServerName(upstream.config.host.clone()))?;
    let tls = tls_connector()?
        .connect(server_name, stream)
        .await
        .map_err(TunnelError::Handshake)?;
    Ok(Box::new(tls))
}

/// Read until the blank line ending an HTTP response head.
///
/// Returns the head (including the terminating blank line) and any bytes
/// that arrived after it.
pub async fn read_response_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::UnexpectedEof);
        }
        let searched_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf[searched_from..]) {
            let end = searched_from + pos + 4;
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TunnelError::HeadTooLarge);
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Status code from an HTTP/1.x status line
fn parse_status(head: &[u8]) -> Option<u16> {
    let line = head.split(|b| *b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn tls_connector() -> Result<TlsConnector, TunnelError> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(TlsConnector::from(Arc::clone(config)));
    }
    let config = Arc::new(build_tls_config()?);
    Ok(TlsConnector::from(Arc::clone(CONFIG.get_or_init(|| config))))
}

fn build_tls_config() -> Result<ClientConfig, TunnelError> {
    let result = rustls_native_certs::load_native_certs();
    for e in &result.errors {
        warn!(error = %e, "Error loading system certificate");
    }

    let mut roots = RootCertStore::empty();
    let mut loaded = 0usize;
    for cert in result.certs {
        match roots.add(cert) {
            Ok(()) => loaded += 1,
            Err(e) => debug!(error = %e, "Skipping invalid system certificate"),
        }
    }
    if loaded == 0 {
        return Err(TunnelError::TlsConfig(
            "no valid system certificates found".to_string(),
        ));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::TlsConfig(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
