//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Boxed error type carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Source address is on the blacklist
    IpBlacklisted,
    /// Source address exceeded its request budget for the window
    RateLimited,
    /// Missing Host header in request
    MissingHostHeader,
    /// Host does not map to a supported upstream
    UnsupportedApi,
    /// Path is not served by the upstream
    UnsupportedPath,
    /// Messages API request without x-api-key
    MissingApiKey,
    /// Completions API request without authorization
    MissingAuthorization,
    /// Path requires an anthropic-beta header
    MissingBetaHeader,
    /// JSON request without a body
    EmptyBody,
    /// JSON request whose body does not parse
    InvalidJson,
    /// Egress proxy pool is empty
    NoProxiesAvailable,
    /// Multipart relay failed
    UploadFailed,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::IpBlacklisted => StatusCode::FORBIDDEN,
            ProxyErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnsupportedApi => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnsupportedPath => StatusCode::NOT_FOUND,
            ProxyErrorCode::MissingApiKey => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::MissingAuthorization => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::MissingBetaHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::EmptyBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InvalidJson => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoProxiesAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UploadFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::IpBlacklisted => "IP_BLACKLISTED",
            ProxyErrorCode::RateLimited => "RATE_LIMITED",
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnsupportedApi => "UNSUPPORTED_API",
            ProxyErrorCode::UnsupportedPath => "UNSUPPORTED_PATH",
            ProxyErrorCode::MissingApiKey => "MISSING_API_KEY",
            ProxyErrorCode::MissingAuthorization => "MISSING_AUTHORIZATION",
            ProxyErrorCode::MissingBetaHeader => "MISSING_BETA_HEADER",
            ProxyErrorCode::EmptyBody => "EMPTY_BODY",
            ProxyErrorCode::InvalidJson => "INVALID_JSON",
            ProxyErrorCode::NoProxiesAvailable => "NO_PROXIES_AVAILABLE",
            ProxyErrorCode::UploadFailed => "UPLOAD_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a complete in-memory payload as a gateway body
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty gateway body
pub fn empty_body() -> GatewayBody {
    full_body(Bytes::new())
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::IpBlacklisted.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyErrorCode::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyErrorCode::MissingApiKey.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyErrorCode::UnsupportedPath.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::NoProxiesAvailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::RateLimited, "Too many requests");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"RATE_LIMITED\""));
        assert!(json.contains("\"message\":\"Too many requests\""));
        assert!(json.contains("\"status\":429"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::IpBlacklisted, "Access denied");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "IP_BLACKLISTED"
        );
    }

    #[test]
    fn test_serialized_code_matches_header_value() {
        for code in [
            ProxyErrorCode::MissingBetaHeader,
            ProxyErrorCode::NoProxiesAvailable,
            ProxyErrorCode::UploadFailed,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_header_value());
        }
    }
}
