//! Token usage extraction from upstream responses
//!
//! Streaming responses are decoded record by record as chunks pass through.
//! Buffered JSON responses are parsed once at the end. Failing to find usage
//! is never an error: the counts simply stay unset.

use hyper::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_TYPE};
use serde_json::Value;

/// Largest non-streaming body kept around for usage extraction
pub const MAX_JSON_BUFFER: usize = 8 * 1024 * 1024;

/// Largest incomplete event record carried between chunks
const MAX_PENDING_RECORD: usize = 1024 * 1024;

/// Token counts observed for one exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

impl TokenUsage {
    pub fn new(input_tokens: Option<i64>, output_tokens: Option<i64>) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Overwrite with whatever `later` observed
    pub fn update(&mut self, later: TokenUsage) {
        if later.input_tokens.is_some() {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens.is_some() {
            self.output_tokens = later.output_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }
}

/// Field naming used by an upstream's JSON `usage` object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDialect {
    /// `input_tokens` / `output_tokens`
    Messages,
    /// `prompt_tokens` / `completion_tokens`, falling back to the
    /// `input_tokens` / `output_tokens` naming of the responses API
    Completions,
}

impl UsageDialect {
    fn read_usage(&self, usage: &Value) -> TokenUsage {
        match self {
            UsageDialect::Messages => TokenUsage::new(
                as_i64(usage.get("input_tokens")),
                as_i64(usage.get("output_tokens")),
            ),
            UsageDialect::Completions => TokenUsage::new(
                as_i64(usage.get("prompt_tokens")).or_else(|| as_i64(usage.get("input_tokens"))),
                as_i64(usage.get("completion_tokens"))
                    .or_else(|| as_i64(usage.get("output_tokens"))),
            ),
        }
    }
}

/// One decoded event-stream record
#[derive(Debug, Clone, PartialEq)]
pub struct SseRecord {
    /// Value of the `event:` line, if the record had one
    pub event: Option<String>,
    pub data: Value,
}

/// The record shapes known to carry usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// `message_start`: `message.usage.input_tokens`
    MessageStart,
    /// `message_delta`: `usage.output_tokens`
    MessageDelta,
    /// `response.completed`: `response.usage.{input,output}_tokens`
    ResponseCompleted,
    /// Chat completion chunk with a `usage` object
    ChatChunk,
    Other,
}

impl SseRecord {
    /// Type tag from the `event:` line, else from the payload's `type` field
    pub fn tag(&self) -> Option<&str> {
        self.event
            .as_deref()
            .or_else(|| self.data.get("type").and_then(Value::as_str))
    }

    pub fn shape(&self) -> RecordShape {
        match self.tag() {
            Some("message_start") => RecordShape::MessageStart,
            Some("message_delta") => RecordShape::MessageDelta,
            Some("response.completed") => RecordShape::ResponseCompleted,
            _ if self.data.get("usage").is_some_and(Value::is_object) => RecordShape::ChatChunk,
            _ => RecordShape::Other,
        }
    }

    pub fn usage(&self) -> TokenUsage {
        let data = &self.data;
        match self.shape() {
            RecordShape::MessageStart => TokenUsage::new(
                as_i64(data.pointer("/message/usage/input_tokens")),
                None,
            ),
            RecordShape::MessageDelta => {
                TokenUsage::new(None, as_i64(data.pointer("/usage/output_tokens")))
            }
            RecordShape::ResponseCompleted => TokenUsage::new(
                as_i64(data.pointer("/response/usage/input_tokens")),
                as_i64(data.pointer("/response/usage/output_tokens")),
            ),
            RecordShape::ChatChunk => TokenUsage::new(
                as_i64(data.pointer("/usage/prompt_tokens")),
                as_i64(data.pointer("/usage/completion_tokens")),
            ),
            RecordShape::Other => TokenUsage::default(),
        }
    }
}

/// Parse the complete records in `chunk`.
///
/// Records are separated by a blank line. A record needs a `data:` line whose
/// payload is JSON; anything else (a lone `event:` line, `[DONE]`, comments)
/// is skipped.
pub fn parse_event_stream(chunk: &str) -> Vec<SseRecord> {
    chunk
        .split("\n\n")
        .filter_map(parse_record)
        .collect()
}

fn parse_record(block: &str) -> Option<SseRecord> {
    let mut event = None;
    let mut data = None;

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    let data = serde_json::from_str(data?).ok()?;
    Some(SseRecord { event, data })
}

/// Incremental event-stream usage decoder.
///
/// Chunks may split records anywhere; the incomplete tail is carried over to
/// the next chunk and flushed by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    pending: Vec<u8>,
    usage: TokenUsage,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let Some(end) = self.pending.windows(2).rposition(|w| w == b"\n\n") else {
            if self.pending.len() > MAX_PENDING_RECORD {
                self.pending.clear();
            }
            return;
        };

        let complete: Vec<u8> = self.pending.drain(..end + 2).collect();
        self.consume(&complete);
    }

    /// Flush the trailing record and return the final counts
    pub fn finish(&mut self) -> TokenUsage {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.consume(&rest);
        }
        self.usage
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    fn consume(&mut self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        for record in parse_event_stream(&text) {
            self.usage.update(record.usage());
        }
    }
}

/// Extract usage from a complete JSON body's top-level `usage` field
pub fn extract_body_usage(dialect: UsageDialect, body: &[u8]) -> TokenUsage {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get("usage").map(|usage| dialect.read_usage(usage)))
        .unwrap_or_default()
}

/// Watches a response body and produces its token usage
#[derive(Debug)]
pub enum UsageMeter {
    EventStream(EventStreamDecoder),
    Json {
        dialect: UsageDialect,
        buffer: Vec<u8>,
        overflowed: bool,
    },
    /// Attachments and other bodies that are never inspected
    Disabled,
}

impl UsageMeter {
    /// Pick a strategy from the upstream response headers
    pub fn for_response(dialect: UsageDialect, headers: &HeaderMap) -> Self {
        if headers.contains_key(CONTENT_DISPOSITION) {
            return UsageMeter::Disabled;
        }

        let is_event_stream = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        if is_event_stream {
            UsageMeter::EventStream(EventStreamDecoder::new())
        } else {
            UsageMeter::Json {
                dialect,
                buffer: Vec::new(),
                overflowed: false,
            }
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        match self {
            UsageMeter::EventStream(decoder) => decoder.push(chunk),
            UsageMeter::Json {
                buffer, overflowed, ..
            } => {
                if *overflowed {
                    return;
                }
                if buffer.len() + chunk.len() > MAX_JSON_BUFFER {
                    *overflowed = true;
                    buffer.clear();
                    buffer.shrink_to_fit();
                    return;
                }
                buffer.extend_from_slice(chunk);
            }
            UsageMeter::Disabled => {}
        }
    }

    /// Counts observed so far, including any trailing data
    pub fn finish(&mut self) -> TokenUsage {
        match self {
            UsageMeter::EventStream(decoder) => decoder.finish(),
            UsageMeter::Json {
                dialect,
                buffer,
                overflowed,
            } => {
                if *overflowed {
                    TokenUsage::default()
                } else {
                    extract_body_usage(*dialect, buffer)
                }
            }
            UsageMeter::Disabled => TokenUsage::default(),
        }
    }
}

fn as_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|v| i64::try_from(v).ok())),
        _ => None,
    }
}
