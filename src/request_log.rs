//! Per-request structured log records
//!
//! Every forwarded exchange produces exactly one [`RequestRecord`]. Records
//! go to the `relaygate::request` tracing target and to a [`LogSink`]; the
//! production sink appends JSON lines to a file per calendar day.

use crate::usage::TokenUsage;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// One line of the request log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub upstream: String,
    pub method: String,
    pub path: String,
    /// Parsed JSON request body, `{}` when there was none
    pub params: Value,
    pub status: Option<u16>,
    /// Elapsed milliseconds
    pub total_time: u64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    #[serde(rename = "proxyIP")]
    pub proxy_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Destination for request records
pub trait LogSink: Send + Sync {
    fn write(&self, record: &RequestRecord);
}

/// Appends records to `<dir>/YYYY-MM-DD.log`, one JSON object per line
#[derive(Debug, Clone)]
pub struct DailyFileSink {
    dir: PathBuf,
}

impl DailyFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File for the current local day
    pub fn current_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.log", Local::now().format("%Y-%m-%d")))
    }

    fn append(dir: &Path, path: &Path, line: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(line)
    }
}

impl LogSink for DailyFileSink {
    fn write(&self, record: &RequestRecord) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize request record");
                return;
            }
        };
        line.push(b'\n');

        let dir = self.dir.clone();
        let path = self.current_path();
        let write = move || {
            if let Err(e) = Self::append(&dir, &path, &line) {
                error!(path = %path.display(), error = %e, "Failed to write request log");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

/// Fans a record out to tracing and the configured sink
#[derive(Clone)]
pub struct RequestLog {
    sink: Arc<dyn LogSink>,
}

impl RequestLog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, record: RequestRecord) {
        info!(
            target: "relaygate::request",
            source_ip = %record.source_ip,
            upstream = %record.upstream,
            method = %record.method,
            path = %record.path,
            status = record.status,
            elapsed_ms = record.total_time,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            proxy = %record.proxy_ip,
            error = record.error.as_deref(),
            "Request completed"
        );
        self.sink.write(&record);
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLog").finish_non_exhaustive()
    }
}

/// What is known about an exchange before its outcome
#[derive(Debug)]
pub struct Exchange {
    pub source_ip: String,
    pub upstream: &'static str,
    pub method: String,
    pub path: String,
    pub params: Value,
    pub proxy: String,
    started: Instant,
}

impl Exchange {
    pub fn start(
        source_ip: impl Into<String>,
        upstream: &'static str,
        method: impl Into<String>,
        path: impl Into<String>,
        proxy: impl Into<String>,
    ) -> Self {
        Self {
            source_ip: source_ip.into(),
            upstream,
            method: method.into(),
            path: path.into(),
            params: Value::Object(Default::default()),
            proxy: proxy.into(),
            started: Instant::now(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Close the exchange into its log record
    pub fn finish(
        self,
        status: Option<u16>,
        usage: TokenUsage,
        error: Option<String>,
    ) -> RequestRecord {
        RequestRecord {
            timestamp: Utc::now(),
            source_ip: self.source_ip,
            upstream: self.upstream.to_string(),
            method: self.method,
            path: self.path,
            params: self.params,
            status,
            total_time: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            proxy_ip: self.proxy,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<RequestRecord>>);

    impl LogSink for Collect {
        fn write(&self, record: &RequestRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn record() -> RequestRecord {
        Exchange::start("1.2.3.4", "claude", "POST", "/v1/messages", "10.0.0.1:3128")
            .with_params(serde_json::json!({"model": "x"}))
            .finish(Some(200), TokenUsage::new(Some(12), Some(34)), None)
    }

    #[test]
    fn test_record_field_names() {
        let json = serde_json::to_value(record()).unwrap();

        assert_eq!(json["sourceIP"], "1.2.3.4");
        assert_eq!(json["upstream"], "claude");
        assert_eq!(json["path"], "/v1/messages");
        assert_eq!(json["params"]["model"], "x");
        assert_eq!(json["status"], 200);
        assert_eq!(json["inputTokens"], 12);
        assert_eq!(json["outputTokens"], 34);
        assert_eq!(json["proxyIP"], "10.0.0.1:3128");
        assert!(json["totalTime"].is_u64());
        assert!(json["timestamp"].is_string());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_missing_usage_serializes_as_null() {
        let record = Exchange::start("1.2.3.4", "openai", "GET", "/v1/models", "p:1").finish(
            None,
            TokenUsage::default(),
            Some("connection refused".to_string()),
        );
        let json = serde_json::to_value(record).unwrap();

        assert!(json["inputTokens"].is_null());
        assert!(json["status"].is_null());
        assert_eq!(json["params"], serde_json::json!({}));
        assert_eq!(json["error"], "connection refused");
    }

    #[test]
    fn test_request_log_forwards_to_sink() {
        let sink = Arc::new(Collect::default());
        let log = RequestLog::new(sink.clone());

        log.emit(record());
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn test_daily_file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DailyFileSink::new(dir.path().join("logs"));

        sink.write(&record());
        sink.write(&record());

        let path = sink.current_path();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".log"));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["outputTokens"], 34);
    }
}
