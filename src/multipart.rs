//! Multipart upload relay
//!
//! The client's multipart body is decoded part by part and re-encoded under
//! a fresh boundary while it is being sent upstream. File contents are
//! streamed chunk by chunk; nothing is buffered whole. The closing boundary
//! is written only after the last part.

use crate::error::{json_error_response, BoxError, GatewayBody, ProxyErrorCode};
use crate::forward::{relay_response, Forwarder};
use crate::pool::ProxyLease;
use crate::request_log::Exchange;
use crate::upstream::Upstream;
use crate::usage::UsageMeter;
use futures::stream;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response};
use multer::Multipart;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Chunks buffered between the decoder and the upstream request
const CHANNEL_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("invalid multipart request: {0}")]
    Parse(#[from] multer::Error),
    #[error("upstream stopped reading the upload")]
    Closed,
}

/// True for `multipart/form-data` requests
pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// A boundary that cannot collide with the client's
pub fn new_boundary() -> String {
    format!("----RelaygateBoundary{}", Uuid::new_v4().simple())
}

/// Quote a value for a `Content-Disposition` parameter
fn quote(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

fn part_header(boundary: &str, name: &str, file_name: Option<&str>, content_type: Option<&str>) -> String {
    let mut header = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
        boundary,
        quote(name)
    );
    if let Some(file_name) = file_name {
        header.push_str(&format!("; filename=\"{}\"", quote(file_name)));
        header.push_str(&format!(
            "\r\nContent-Type: {}",
            content_type.unwrap_or("application/octet-stream")
        ));
    }
    header.push_str("\r\n\r\n");
    header
}

/// Re-encode every part of `multipart` under `boundary` into `tx`.
/// Returns the number of parts written.
pub async fn encode_parts(
    mut multipart: Multipart<'static>,
    boundary: &str,
    tx: &mpsc::Sender<Result<Bytes, BoxError>>,
) -> Result<usize, MultipartError> {
    let send = |bytes: Bytes| async move {
        tx.send(Ok(bytes)).await.map_err(|_| MultipartError::Closed)
    };

    let mut processed = 0usize;
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(|f| f.to_string());
        let content_type = field.content_type().map(|m| m.to_string());

        let header = part_header(boundary, &name, file_name.as_deref(), content_type.as_deref());
        send(Bytes::from(header)).await?;

        let mut size = 0usize;
        while let Some(chunk) = field.chunk().await? {
            size += chunk.len();
            send(chunk).await?;
        }
        send(Bytes::from_static(b"\r\n")).await?;

        processed += 1;
        debug!(field = %name, file = file_name.as_deref(), size, processed, "Relayed multipart part");
    }

    send(Bytes::from(format!("--{}--\r\n", boundary))).await?;
    Ok(processed)
}

/// Relay a multipart upload through the leased proxy
pub async fn relay_multipart(
    req: Request<Incoming>,
    upstream: Upstream,
    exchange: Exchange,
    lease: ProxyLease,
    forwarder: &Forwarder,
) -> Response<GatewayBody> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let incoming_boundary = match multer::parse_boundary(content_type) {
        Ok(boundary) => boundary,
        Err(e) => {
            error!(path = %path_and_query, error = %e, "Multipart request without a usable boundary");
            return upload_failed(forwarder, exchange, e.to_string());
        }
    };

    let client = match forwarder.clients().get(lease.proxy()) {
        Ok(client) => client,
        Err(e) => {
            error!(proxy = lease.proxy(), error = %e, "No upstream client for proxy");
            return upload_failed(forwarder, exchange, e.to_string());
        }
    };

    let boundary = new_boundary();
    let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(CHANNEL_DEPTH);
    let multipart = Multipart::new(body.into_data_stream(), incoming_boundary);

    let writer = {
        let boundary = boundary.clone();
        tokio::spawn(async move {
            let result = encode_parts(multipart, &boundary, &tx).await;
            match &result {
                Ok(processed) => info!(processed, "Multipart upload relayed"),
                Err(e) => {
                    error!(error = %e, "Multipart upload failed");
                    let _ = tx.send(Err(e.to_string().into())).await;
                }
            }
            result
        })
    };

    let upload = reqwest::Body::wrap_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }));

    let mut headers = upstream.filter_headers(&parts.headers);
    headers.remove(CONTENT_TYPE);
    if let Ok(value) = HeaderValue::from_str(&format!("multipart/form-data; boundary={}", boundary)) {
        headers.insert(CONTENT_TYPE, value);
    }

    let mut request = client
        .post(upstream.url(&path_and_query))
        .headers(headers)
        .body(upload);
    if let Some(timeout) = upstream.config.request_timeout() {
        request = request.timeout(timeout);
    }

    match request.send().await {
        Ok(response) => relay_response(
            response,
            UsageMeter::Disabled,
            exchange,
            lease,
            forwarder.log().clone(),
        ),
        Err(e) => {
            let reason = match writer.await {
                Ok(Err(upload_error)) => upload_error.to_string(),
                _ => e.to_string(),
            };
            error!(proxy = lease.proxy(), path = %path_and_query, error = %reason, "Multipart relay failed");
            upload_failed(forwarder, exchange, reason)
        }
    }
}

fn upload_failed(forwarder: &Forwarder, exchange: Exchange, reason: String) -> Response<GatewayBody> {
    let status = ProxyErrorCode::UploadFailed.status_code().as_u16();
    forwarder
        .log()
        .emit(exchange.finish(Some(status), Default::default(), Some(reason)));
    json_error_response(ProxyErrorCode::UploadFailed, "File upload failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "X-CLIENT-BOUNDARY";

    fn client_body() -> Vec<u8> {
        format!(
            "--{b}\r\n\
Content-Disposition: form-data; name=\"purpose\"\r\n\r\n\
fine-tune\r\n\
--{b}\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"train.jsonl\"\r\n\
Content-Type: application/jsonl\r\n\r\n\
{{\"prompt\":\"a\"}}\n{{\"prompt\":\"b\"}}\n\r\n\
--{b}--\r\n",
            b = BOUNDARY
        )
        .into_bytes()
    }

    fn multipart_from(body: Vec<u8>, boundary: &str) -> Multipart<'static> {
        let chunks: Vec<Result<Bytes, std::io::Error>> = body
            .chunks(9)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Multipart::new(stream::iter(chunks), boundary.to_string())
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Bytes, BoxError>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.extend_from_slice(&item.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_reencode_under_new_boundary() {
        let boundary = new_boundary();
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(drain(rx));

        let processed = encode_parts(multipart_from(client_body(), BOUNDARY), &boundary, &tx)
            .await
            .unwrap();
        drop(tx);
        let encoded = collector.await.unwrap();

        assert_eq!(processed, 2);
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(!text.contains(BOUNDARY));
        assert!(text.ends_with(&format!("--{}--\r\n", boundary)));

        let mut reparsed = multipart_from(encoded, &boundary);
        let field = reparsed.next_field().await.unwrap().unwrap();
        assert_eq!(field.name(), Some("purpose"));
        assert_eq!(field.text().await.unwrap(), "fine-tune");

        let field = reparsed.next_field().await.unwrap().unwrap();
        assert_eq!(field.name(), Some("file"));
        assert_eq!(field.file_name(), Some("train.jsonl"));
        assert_eq!(field.content_type().unwrap().to_string(), "application/jsonl");
        assert_eq!(
            field.bytes().await.unwrap(),
            Bytes::from_static(b"{\"prompt\":\"a\"}\n{\"prompt\":\"b\"}\n")
        );
        assert!(reparsed.next_field().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_form_still_closes() {
        let boundary = "B";
        let (tx, rx) = mpsc::channel(4);
        let collector = tokio::spawn(drain(rx));

        let body = format!("--{}--\r\n", BOUNDARY).into_bytes();
        let processed = encode_parts(multipart_from(body, BOUNDARY), boundary, &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(processed, 0);
        assert_eq!(collector.await.unwrap(), b"--B--\r\n");
    }

    #[tokio::test]
    async fn test_truncated_body_fails() {
        let (tx, rx) = mpsc::channel(16);
        let collector = tokio::spawn(async move {
            let mut rx = rx;
            while rx.recv().await.is_some() {}
        });

        let mut body = client_body();
        body.truncate(body.len() / 2);
        let result = encode_parts(multipart_from(body, BOUNDARY), "B", &tx).await;
        drop(tx);
        collector.await.unwrap();

        assert!(matches!(result, Err(MultipartError::Parse(_))));
    }

    #[test]
    fn test_is_multipart() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("multipart/form-data; boundary=abc"),
        );
        assert!(is_multipart(&headers));

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_multipart(&headers));
        assert!(!is_multipart(&HeaderMap::new()));
    }

    #[test]
    fn test_part_header_quotes_names() {
        let header = part_header("B", "file", Some("we\"ird.txt"), None);
        assert_eq!(
            header,
            "--B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"we%22ird.txt\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        );
    }
}
