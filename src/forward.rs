//! Forwarding engine
//!
//! Relays one client request to its upstream through an egress proxy and
//! streams the upstream response back unmodified. Token usage is observed on
//! the way through and a single log record is emitted when the body ends,
//! fails, or is dropped by a departing client.

use crate::error::{json_error_response, BoxError, GatewayBody, ProxyErrorCode};
use crate::pool::ProxyLease;
use crate::request_log::{Exchange, RequestLog};
use crate::upstream::Upstream;
use crate::usage::UsageMeter;
use dashmap::DashMap;
use futures::stream::{BoxStream, Stream, StreamExt};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Method, Response};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// Response headers that describe the upstream connection, not the payload
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to build client for proxy {proxy}: {source}")]
    Client {
        proxy: String,
        source: reqwest::Error,
    },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// One `reqwest::Client` per egress proxy
#[derive(Debug, Default)]
pub struct UpstreamClients {
    clients: DashMap<String, reqwest::Client>,
}

impl UpstreamClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client routing through `proxy`, built on first use
    pub fn get(&self, proxy: &str) -> Result<reqwest::Client, ForwardError> {
        if let Some(client) = self.clients.get(proxy) {
            return Ok(client.clone());
        }

        let client = reqwest::Proxy::all(format!("http://{}", proxy))
            .and_then(|p| {
                reqwest::Client::builder()
                    .proxy(p)
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
            })
            .map_err(|source| ForwardError::Client {
                proxy: proxy.to_string(),
                source,
            })?;

        debug!(proxy, "Built upstream client");
        self.clients.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    /// Forget clients for proxies that are no longer in the pool
    pub fn retain(&self, proxies: &[String]) {
        let keep: HashSet<&str> = proxies.iter().map(String::as_str).collect();
        self.clients.retain(|proxy, _| keep.contains(proxy.as_str()));
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// A buffered client request that passed validation
#[derive(Debug)]
pub struct ForwardRequest {
    pub upstream: Upstream,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends requests upstream and wraps the responses
#[derive(Debug, Clone)]
pub struct Forwarder {
    clients: Arc<UpstreamClients>,
    log: RequestLog,
}

impl Forwarder {
    pub fn new(clients: Arc<UpstreamClients>, log: RequestLog) -> Self {
        Self { clients, log }
    }

    pub fn clients(&self) -> &Arc<UpstreamClients> {
        &self.clients
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    /// Relay a standard request/response exchange
    pub async fn forward(
        &self,
        request: ForwardRequest,
        exchange: Exchange,
        lease: ProxyLease,
    ) -> Response<GatewayBody> {
        let dialect = request.upstream.kind.dialect();
        match self.send(request, lease.proxy()).await {
            Ok(response) => {
                let meter = UsageMeter::for_response(dialect, response.headers());
                relay_response(response, meter, exchange, lease, self.log.clone())
            }
            Err(e) => {
                error!(proxy = lease.proxy(), path = %exchange.path, error = %e, "Upstream request failed");
                self.fail(exchange, e.to_string());
                json_error_response(ProxyErrorCode::InternalError, "Internal server error")
            }
        }
    }

    async fn send(&self, request: ForwardRequest, proxy: &str) -> Result<reqwest::Response, ForwardError> {
        let client = self.clients.get(proxy)?;
        let url = request.upstream.url(&request.path_and_query);

        let mut builder = client
            .request(request.method.clone(), url)
            .headers(request.upstream.filter_headers(&request.headers));
        if request.method != Method::GET && request.method != Method::HEAD {
            builder = builder.body(request.body);
        }
        if let Some(timeout) = request.upstream.config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(builder.send().await?)
    }

    /// Log an exchange that never produced an upstream response
    pub fn fail(&self, exchange: Exchange, error: String) {
        let status = ProxyErrorCode::InternalError.status_code().as_u16();
        self.log
            .emit(exchange.finish(Some(status), Default::default(), Some(error)));
    }
}

/// Mirror an upstream response to the client, metering its body
pub fn relay_response(
    response: reqwest::Response,
    meter: UsageMeter,
    exchange: Exchange,
    lease: ProxyLease,
    log: RequestLog,
) -> Response<GatewayBody> {
    let status = response.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        copy_response_headers(response.headers(), headers);
    }

    let body = MeteredBody::new(
        response.bytes_stream(),
        meter,
        Completion {
            exchange,
            status: status.as_u16(),
            log,
            _lease: lease,
        },
    );

    match builder.body(body.boxed_unsync()) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to build relayed response");
            json_error_response(ProxyErrorCode::InternalError, "Internal server error")
        }
    }
}

/// Copy end-to-end headers, skipping hop-by-hop and `proxy-*` headers
pub fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || name.starts_with("proxy-")
}

/// Everything needed to close out an exchange once its body finishes
struct Completion {
    exchange: Exchange,
    status: u16,
    log: RequestLog,
    _lease: ProxyLease,
}

/// Response body that forwards upstream chunks while metering them.
///
/// Dropping the body before the upstream finished drops the upstream stream,
/// which aborts the upstream request.
pub struct MeteredBody {
    stream: Option<BoxStream<'static, Result<Bytes, reqwest::Error>>>,
    meter: UsageMeter,
    completion: Option<Completion>,
}

impl MeteredBody {
    fn new(
        stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        meter: UsageMeter,
        completion: Completion,
    ) -> Self {
        Self {
            stream: Some(stream.boxed()),
            meter,
            completion: Some(completion),
        }
    }

    fn complete(&mut self, error: Option<String>) {
        self.stream = None;
        let Some(completion) = self.completion.take() else {
            return;
        };

        let usage = self.meter.finish();
        let record = completion
            .exchange
            .finish(Some(completion.status), usage, error);
        completion.log.emit(record);
        // Lease drops here, releasing the proxy
    }
}

impl Body for MeteredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.meter.observe(&chunk);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "Upstream body failed mid-stream");
                this.complete(Some(e.to_string()));
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.complete(None);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.stream.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        // The stream only bounds its chunk count, not the byte length
        match &self.stream {
            Some(_) => SizeHint::default(),
            None => SizeHint::with_exact(0),
        }
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        if self.completion.is_some() {
            debug!("Response body dropped before completion");
            self.complete(Some("client disconnected".to_string()));
        }
    }
}
