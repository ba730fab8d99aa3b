//! Socket upgrade relay
//!
//! The upgrade request is replayed to the upstream over a tunnel through the
//! same egress proxy. Once the upstream switches protocols, the client
//! connection is upgraded too and bytes are copied both ways until either
//! side finishes, at which point both are closed.

use crate::error::{empty_body, full_body, json_error_response, GatewayBody, ProxyErrorCode};
use crate::pool::ProxyLease;
use crate::request_log::{Exchange, RequestLog};
use crate::tunnel::{self, BoxedStream};
use crate::upstream::Upstream;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Largest rejection body relayed back to the client
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// How long to wait for a rejection body to arrive
const REJECTION_BODY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client headers replayed on the upstream handshake
const HANDSHAKE_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
    "authorization",
    "openai-beta",
];

/// True for `Connection: upgrade` + `Upgrade: websocket`
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_upgrade_connection = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && is_websocket
}

/// Build the raw upgrade request sent to the upstream
pub fn build_upgrade_request(upstream: &Upstream, path_and_query: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut request = format!("GET {} HTTP/1.1\r\n", path_and_query);
    request.push_str(&format!("Host: {}\r\n", upstream.authority()));
    request.push_str("Upgrade: websocket\r\n");
    request.push_str("Connection: Upgrade\r\n");

    for name in HANDSHAKE_HEADERS {
        for value in headers.get_all(*name) {
            if let Ok(v) = value.to_str() {
                request.push_str(&format!("{}: {}\r\n", name, v));
            }
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's handshake response head
pub fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Decode a complete chunked body, or `None` while the terminating chunk
/// has not arrived yet
fn decode_chunked(data: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = pos + data[pos..].windows(2).position(|w| w == b"\r\n")?;
        let size_line = std::str::from_utf8(&data[pos..line_end]).ok()?;
        let size_hex = size_line.split(';').next()?.trim();
        let size = usize::from_str_radix(size_hex, 16).ok()?;
        pos = line_end + 2;

        if size == 0 {
            return Some(body);
        }
        if data.len() < pos + size + 2 {
            return None;
        }
        body.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2;
    }
}

/// Read the body of a refused upgrade, starting from the bytes that arrived
/// with the head. Bounded by content-length, the chunked terminator or EOF.
async fn read_rejection_body<S>(
    stream: &mut S,
    mut buf: Vec<u8>,
    headers: &[(String, String)],
) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let content_length = header_value(headers, "content-length").and_then(|v| v.parse::<usize>().ok());
    let chunked = header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let mut chunk = [0u8; 4096];
    loop {
        if let Some(len) = content_length {
            if buf.len() >= len {
                buf.truncate(len);
                return Ok(buf);
            }
        } else if chunked {
            if let Some(body) = decode_chunked(&buf) {
                return Ok(body);
            }
        }
        if buf.len() > MAX_REJECTION_BODY {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "rejection body too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if content_length.is_some() || chunked {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            return Ok(buf);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Rebuild the upstream's handshake answer; framing headers are dropped
/// and recomputed from `body`
fn handshake_response(
    status: StatusCode,
    headers: &[(String, String)],
    body: GatewayBody,
) -> Response<GatewayBody> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), value);
        }
    }

    response.body(body).unwrap_or_else(|e| {
        error!(error = %e, "Invalid upstream handshake headers");
        json_error_response(ProxyErrorCode::InternalError, "Internal server error")
    })
}

/// Relay a websocket upgrade through the leased proxy
pub async fn relay_upgrade(
    req: Request<Incoming>,
    upstream: Upstream,
    exchange: Exchange,
    lease: ProxyLease,
    log: RequestLog,
) -> Response<GatewayBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let raw_request = build_upgrade_request(&upstream, &path_and_query, req.headers());

    let handshake = async {
        let mut stream = tunnel::open(lease.proxy(), &upstream).await?;
        stream.write_all(&raw_request).await?;
        let (head, rest) = tunnel::read_response_head(&mut stream).await?;
        Ok::<_, tunnel::TunnelError>((stream, head, rest))
    };

    let (mut stream, head, rest) = match handshake.await {
        Ok(parts) => parts,
        Err(e) => {
            error!(proxy = lease.proxy(), path = %path_and_query, error = %e, "Upstream upgrade failed");
            let status = ProxyErrorCode::InternalError.status_code().as_u16();
            log.emit(exchange.finish(Some(status), Default::default(), Some(e.to_string())));
            return json_error_response(ProxyErrorCode::InternalError, "Internal server error");
        }
    };

    let Some((status, headers)) = parse_upgrade_response(&head) else {
        error!(proxy = lease.proxy(), "Malformed upgrade response from upstream");
        let status = ProxyErrorCode::InternalError.status_code().as_u16();
        log.emit(exchange.finish(
            Some(status),
            Default::default(),
            Some("malformed upgrade response".to_string()),
        ));
        return json_error_response(ProxyErrorCode::InternalError, "Internal server error");
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, path = %path_and_query, "Upstream rejected upgrade request");
        let body = tokio::time::timeout(
            REJECTION_BODY_TIMEOUT,
            read_rejection_body(&mut stream, rest, &headers),
        )
        .await
        .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()));

        return match body {
            Ok(body) => {
                log.emit(exchange.finish(Some(status.as_u16()), Default::default(), None));
                handshake_response(status, &headers, full_body(body))
            }
            Err(e) => {
                error!(proxy = lease.proxy(), status = %status, error = %e, "Failed to read upgrade rejection body");
                let code = ProxyErrorCode::InternalError.status_code().as_u16();
                log.emit(exchange.finish(Some(code), Default::default(), Some(e.to_string())));
                json_error_response(ProxyErrorCode::InternalError, "Internal server error")
            }
        };
    }

    info!(proxy = lease.proxy(), path = %path_and_query, "WebSocket upgrade successful");

    tokio::spawn(async move {
        let error = match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, stream, rest).await.err(),
            Err(e) => {
                error!(error = %e, "Failed to upgrade client connection");
                Some(e.to_string())
            }
        };
        log.emit(exchange.finish(Some(101), Default::default(), error));
        drop(lease);
    });

    handshake_response(status, &headers, empty_body())
}

/// Copy bytes both ways; the first direction to finish ends the relay
async fn relay(client: Upgraded, upstream: BoxedStream, early: Vec<u8>) -> Result<(), String> {
    let mut client = TokioIo::new(client);
    if !early.is_empty() {
        client.write_all(&early).await.map_err(|e| e.to_string())?;
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (direction, result) = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut upstream_write) => ("client", r),
        r = tokio::io::copy(&mut upstream_read, &mut client_write) => ("upstream", r),
    };

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    match result {
        Ok(bytes) => {
            debug!(closed_by = direction, bytes, "WebSocket relay closed");
            Ok(())
        }
        Err(e) => {
            debug!(closed_by = direction, error = %e, "WebSocket relay closed with error");
            Err(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::upstream::UpstreamKind;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "WebSocket"),
        ])));
        assert!(!is_upgrade_request(&headers(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&headers(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c"),
        ])));
    }

    #[test]
    fn test_build_upgrade_request_carries_auth_only() {
        let upstream = Upstream::new(UpstreamKind::OpenAi, UpstreamConfig::new("api.openai.com"));
        let client = headers(&[
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("sec-websocket-version", "13"),
            ("authorization", "Bearer sk-test"),
            ("openai-beta", "realtime=v1"),
            ("cookie", "session=1"),
        ]);

        let raw = String::from_utf8(build_upgrade_request(
            &upstream,
            "/v1/realtime?model=gpt-4o-realtime",
            &client,
        ))
        .unwrap();

        assert!(raw.starts_with("GET /v1/realtime?model=gpt-4o-realtime HTTP/1.1\r\n"));
        assert!(raw.contains("Host: api.openai.com\r\n"));
        assert!(raw.contains("sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(raw.contains("authorization: Bearer sk-test\r\n"));
        assert!(raw.contains("openai-beta: realtime=v1\r\n"));
        assert!(!raw.contains("cookie"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let (status, headers) = parse_upgrade_response(head).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[2].0, "Sec-WebSocket-Accept");

        assert!(parse_upgrade_response(b"garbage\r\n\r\n").is_none());
    }

    fn owned(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_handshake_response_keeps_rejection_body() {
        use http_body_util::BodyExt;

        let response = handshake_response(
            StatusCode::UNAUTHORIZED,
            &owned(&[
                ("Content-Length", "12"),
                ("Transfer-Encoding", "chunked"),
                ("WWW-Authenticate", "Bearer"),
            ]),
            full_body("access denied"),
        );

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("content-length").is_none());
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers().get("www-authenticate").unwrap(), "Bearer");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"access denied");
    }

    #[tokio::test]
    async fn test_rejection_body_by_content_length() {
        let headers = owned(&[("Content-Length", "19")]);
        let mut remainder: &[u8] = b"bad key\"}trailing";

        let body = read_rejection_body(&mut remainder, b"{\"error\":\"".to_vec(), &headers)
            .await
            .unwrap();
        assert_eq!(body, b"{\"error\":\"bad key\"}");
    }

    #[tokio::test]
    async fn test_rejection_body_chunked_and_eof() {
        let headers = owned(&[("Transfer-Encoding", "chunked")]);
        let mut remainder: &[u8] = b"5\r\nworld\r\n0\r\n\r\n";
        let body = read_rejection_body(&mut remainder, b"6\r\nhello \r\n".to_vec(), &headers)
            .await
            .unwrap();
        assert_eq!(body, b"hello world");

        let mut remainder: &[u8] = b" closed";
        let body = read_rejection_body(&mut remainder, b"connection".to_vec(), &[])
            .await
            .unwrap();
        assert_eq!(body, b"connection closed");

        let mut short: &[u8] = b"abc";
        let headers = owned(&[("content-length", "10")]);
        assert!(read_rejection_body(&mut short, Vec::new(), &headers).await.is_err());
    }

    #[test]
    fn test_decode_chunked_waits_for_terminator() {
        assert_eq!(decode_chunked(b"3\r\nabc\r\n"), None);
        assert_eq!(decode_chunked(b"3;ext=1\r\nabc\r\n0\r\n\r\n"), Some(b"abc".to_vec()));
        assert_eq!(decode_chunked(b"zz\r\n"), None);
    }
}
