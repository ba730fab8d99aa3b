//! Upstream APIs fronted by the gateway
//!
//! Each upstream is reached through a virtual host prefix, forwards a fixed
//! allow-list of client headers and enforces its own protocol preconditions.

use crate::config::{UpstreamConfig, UpstreamsConfig};
use crate::error::ProxyErrorCode;
use crate::usage::UsageDialect;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::Method;
use serde_json::Value;

const CLAUDE_HEADERS: &[&str] = &["x-api-key", "anthropic-version", "anthropic-beta", "content-type"];
const OPENAI_HEADERS: &[&str] = &["authorization", "content-type", "openai-beta"];

const MESSAGES_PATH: &str = "/v1/messages";
const BATCHES_PATH: &str = "/v1/messages/batches";

/// Which upstream API a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamKind {
    /// Messages API, served on `claude.api.*`
    Claude,
    /// Completions/chat API, served on `openai.api.*`
    OpenAi,
}

impl UpstreamKind {
    /// Route a lower-cased hostname (port already stripped)
    pub fn from_host(hostname: &str) -> Option<Self> {
        if hostname.starts_with("claude.api.") {
            Some(UpstreamKind::Claude)
        } else if hostname.starts_with("openai.api.") {
            Some(UpstreamKind::OpenAi)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpstreamKind::Claude => "claude",
            UpstreamKind::OpenAi => "openai",
        }
    }

    /// Client headers that may be forwarded upstream
    pub fn allowed_headers(&self) -> &'static [&'static str] {
        match self {
            UpstreamKind::Claude => CLAUDE_HEADERS,
            UpstreamKind::OpenAi => OPENAI_HEADERS,
        }
    }

    pub fn dialect(&self) -> UsageDialect {
        match self {
            UpstreamKind::Claude => UsageDialect::Messages,
            UpstreamKind::OpenAi => UsageDialect::Completions,
        }
    }

    /// Check the request shape this upstream insists on
    pub fn check_preconditions(&self, path: &str, headers: &HeaderMap) -> Result<(), Precondition> {
        match self {
            UpstreamKind::Claude => {
                if !path.starts_with(MESSAGES_PATH) {
                    return Err(Precondition::UnsupportedPath);
                }
                if !has_header(headers, "x-api-key") {
                    return Err(Precondition::MissingApiKey);
                }
                if path.starts_with(BATCHES_PATH) && !has_header(headers, "anthropic-beta") {
                    return Err(Precondition::MissingBetaHeader);
                }
                Ok(())
            }
            UpstreamKind::OpenAi => {
                if !has_header(headers, "authorization") {
                    return Err(Precondition::MissingAuthorization);
                }
                Ok(())
            }
        }
    }

    /// Validate a buffered JSON request body and return it as log params.
    ///
    /// Only `POST`/`PUT` with `Content-Type: application/json` are checked;
    /// anything else yields an empty object. The messages API also rejects
    /// an empty body, the completions API treats it as malformed JSON.
    pub fn parse_params(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Value, ProxyErrorCode> {
        let empty = Value::Object(Default::default());
        if (method != Method::POST && method != Method::PUT) || !is_json(headers) {
            return Ok(empty);
        }

        if body.is_empty() && *self == UpstreamKind::Claude {
            return Err(ProxyErrorCode::EmptyBody);
        }
        serde_json::from_slice(body).map_err(|_| ProxyErrorCode::InvalidJson)
    }
}

/// A protocol precondition the request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    UnsupportedPath,
    MissingApiKey,
    MissingBetaHeader,
    MissingAuthorization,
}

impl Precondition {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            Precondition::UnsupportedPath => ProxyErrorCode::UnsupportedPath,
            Precondition::MissingApiKey => ProxyErrorCode::MissingApiKey,
            Precondition::MissingBetaHeader => ProxyErrorCode::MissingBetaHeader,
            Precondition::MissingAuthorization => ProxyErrorCode::MissingAuthorization,
        }
    }

    /// Tag recorded against the source IP
    pub fn error_type(&self) -> &'static str {
        match self {
            Precondition::UnsupportedPath => "unsupported_path",
            Precondition::MissingApiKey => "missing_api_key",
            Precondition::MissingBetaHeader => "missing_beta_header",
            Precondition::MissingAuthorization => "missing_authorization",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Precondition::UnsupportedPath => "Unsupported API path",
            Precondition::MissingApiKey => "Missing x-api-key header",
            Precondition::MissingBetaHeader => "This path requires an anthropic-beta header",
            Precondition::MissingAuthorization => "Missing authorization header",
        }
    }
}

/// A routed upstream: its kind plus where it lives
#[derive(Debug, Clone)]
pub struct Upstream {
    pub kind: UpstreamKind,
    pub config: UpstreamConfig,
}

impl Upstream {
    pub fn new(kind: UpstreamKind, config: UpstreamConfig) -> Self {
        Self { kind, config }
    }

    /// Absolute URL for a client path and query
    pub fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.config.base_url(), path_and_query)
    }

    /// Value sent as the upstream `Host` header
    pub fn authority(&self) -> String {
        match self.config.port {
            Some(port) => format!("{}:{}", self.config.host, port),
            None => self.config.host.clone(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.config.scheme == "https"
    }

    /// Copy only allow-listed headers from the client request and point
    /// `Host` at the upstream
    pub fn filter_headers(&self, client: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for &name in self.kind.allowed_headers() {
            let name = HeaderName::from_static(name);
            for value in client.get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(host) = HeaderValue::from_str(&self.authority()) {
            headers.insert(HOST, host);
        }
        headers
    }
}

/// The configured upstreams, looked up by kind
#[derive(Debug, Clone)]
pub struct UpstreamSet {
    claude: Upstream,
    openai: Upstream,
}

impl UpstreamSet {
    pub fn from_config(config: &UpstreamsConfig) -> Self {
        Self {
            claude: Upstream::new(UpstreamKind::Claude, config.claude.clone()),
            openai: Upstream::new(UpstreamKind::OpenAi, config.openai.clone()),
        }
    }

    pub fn get(&self, kind: UpstreamKind) -> &Upstream {
        match kind {
            UpstreamKind::Claude => &self.claude,
            UpstreamKind::OpenAi => &self.openai,
        }
    }

    /// Route a hostname to its upstream
    pub fn route(&self, hostname: &str) -> Option<&Upstream> {
        UpstreamKind::from_host(hostname).map(|kind| self.get(kind))
    }
}

fn has_header(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .map(|v| !v.as_bytes().is_empty())
        .unwrap_or(false)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_route_by_host_prefix() {
        assert_eq!(UpstreamKind::from_host("claude.api.example.com"), Some(UpstreamKind::Claude));
        assert_eq!(UpstreamKind::from_host("openai.api.example.com"), Some(UpstreamKind::OpenAi));
        assert_eq!(UpstreamKind::from_host("api.example.com"), None);
        assert_eq!(UpstreamKind::from_host("www.claude.api.example.com"), None);
    }

    #[test]
    fn test_claude_preconditions() {
        let kind = UpstreamKind::Claude;
        let key = headers(&[("x-api-key", "sk-test")]);

        assert_eq!(kind.check_preconditions("/v1/messages", &key), Ok(()));
        assert_eq!(
            kind.check_preconditions("/v1/complete", &key),
            Err(Precondition::UnsupportedPath)
        );
        assert_eq!(
            kind.check_preconditions("/v1/messages", &HeaderMap::new()),
            Err(Precondition::MissingApiKey)
        );
        assert_eq!(
            kind.check_preconditions("/v1/messages/batches", &key),
            Err(Precondition::MissingBetaHeader)
        );

        let beta = headers(&[("x-api-key", "sk-test"), ("anthropic-beta", "message-batches-2024-09-24")]);
        assert_eq!(kind.check_preconditions("/v1/messages/batches", &beta), Ok(()));
    }

    #[test]
    fn test_openai_preconditions() {
        let kind = UpstreamKind::OpenAi;

        assert_eq!(
            kind.check_preconditions("/v1/chat/completions", &HeaderMap::new()),
            Err(Precondition::MissingAuthorization)
        );
        let auth = headers(&[("authorization", "Bearer sk-test")]);
        assert_eq!(kind.check_preconditions("/v1/anything", &auth), Ok(()));
        assert_eq!(Precondition::MissingAuthorization.error_type(), "missing_authorization");
        assert_eq!(
            Precondition::MissingAuthorization.code(),
            ProxyErrorCode::MissingAuthorization
        );
    }

    #[test]
    fn test_filter_headers_allow_list() {
        let upstream = Upstream::new(UpstreamKind::Claude, UpstreamConfig::new("api.anthropic.com"));
        let client = headers(&[
            ("x-api-key", "sk-test"),
            ("anthropic-version", "2023-06-01"),
            ("content-type", "application/json"),
            ("cookie", "tracking=1"),
            ("authorization", "Bearer leak"),
            ("host", "claude.api.example.com"),
        ]);

        let filtered = upstream.filter_headers(&client);
        assert_eq!(filtered.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(filtered.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(filtered.get("content-type").unwrap(), "application/json");
        assert_eq!(filtered.get("host").unwrap(), "api.anthropic.com");
        assert!(filtered.get("cookie").is_none());
        assert!(filtered.get("authorization").is_none());
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_authority_includes_explicit_port() {
        let mut config = UpstreamConfig::new("127.0.0.1");
        config.scheme = "http".to_string();
        config.port = Some(9000);
        let upstream = Upstream::new(UpstreamKind::OpenAi, config);

        assert_eq!(upstream.authority(), "127.0.0.1:9000");
        assert_eq!(upstream.url("/v1/models?limit=1"), "http://127.0.0.1:9000/v1/models?limit=1");
        assert!(!upstream.is_tls());
    }

    #[test]
    fn test_parse_params() {
        let json = headers(&[("content-type", "application/json")]);

        assert_eq!(
            UpstreamKind::Claude.parse_params(&Method::POST, &json, br#"{"model":"x"}"#),
            Ok(serde_json::json!({"model": "x"}))
        );
        assert_eq!(
            UpstreamKind::Claude.parse_params(&Method::POST, &json, b""),
            Err(ProxyErrorCode::EmptyBody)
        );
        assert_eq!(
            UpstreamKind::OpenAi.parse_params(&Method::POST, &json, b""),
            Err(ProxyErrorCode::InvalidJson)
        );
        assert_eq!(
            UpstreamKind::OpenAi.parse_params(&Method::PUT, &json, b"{oops"),
            Err(ProxyErrorCode::InvalidJson)
        );

        // Not validated: wrong method or content type
        assert_eq!(
            UpstreamKind::Claude.parse_params(&Method::GET, &json, b"{oops"),
            Ok(serde_json::json!({}))
        );
        let text = headers(&[("content-type", "text/plain")]);
        assert_eq!(
            UpstreamKind::Claude.parse_params(&Method::POST, &text, b"hello"),
            Ok(serde_json::json!({}))
        );
    }

    #[test]
    fn test_upstream_set_route() {
        let set = UpstreamSet::from_config(&UpstreamsConfig::default());

        assert_eq!(set.route("claude.api.x.io").unwrap().config.host, "api.anthropic.com");
        assert_eq!(set.route("openai.api.x.io").unwrap().kind, UpstreamKind::OpenAi);
        assert!(set.route("x.io").is_none());
    }
}
