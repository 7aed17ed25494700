//! Relay HTTP tunnel envelopes.
//!
//! A relay peer accepts `http.request` datagrams and answers on the same
//! correlation `id`:
//!
//! ```text
//! -> {event: "http.request", id, req: {url|service+path, method, headers,
//!                                      timeout_ms, json?, body_b64?, stream?}}
//! <- {event: "relay.response", id, ok, status, headers, json?, body_b64?, ...}
//! ```
//!
//! Streaming responses are split into a `begin` frame, any number of `chunk`
//! (raw base64 body segments) or `lines` (batched NDJSON/SSE lines) frames
//! tagged with a per-stream `seq`, optional `keepalive` frames while the
//! upstream is quiet, and a terminal `end` frame. Frames may arrive out of
//! order; [`crate::reorder::SeqBuffer`] restores ordering on the consumer
//! side.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name for tunnelled HTTP requests.
pub const EVENT_HTTP_REQUEST: &str = "http.request";

/// Header that asks the relay to stream the response as chunk frames.
pub const STREAM_HEADER: &str = "X-Relay-Stream";

/// Errors raised while decoding relay frames.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("frame has no event field")]
    MissingEvent,
    #[error("frame has no id field")]
    MissingId,
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed {event} frame: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The HTTP request tunnelled inside an `http.request` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayHttpRequest {
    /// Absolute URL. Either this or `service` + `path` must be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Logical service name resolved by the relay peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// JSON body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Raw body, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    /// `"chunks"` requests a streamed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl RelayHttpRequest {
    /// A GET-shaped request for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: "GET".into(),
            timeout_ms: 45_000,
            ..Default::default()
        }
    }

    /// A POST with a JSON body.
    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: Some(url.into()),
            method: "POST".into(),
            timeout_ms: 45_000,
            json: Some(body),
            ..Default::default()
        }
    }

    /// A POST with a raw binary body.
    pub fn post_bytes(url: impl Into<String>, body: &[u8]) -> Self {
        Self {
            url: Some(url.into()),
            method: "POST".into(),
            timeout_ms: 45_000,
            body_b64: Some(base64::engine::general_purpose::STANDARD.encode(body)),
            ..Default::default()
        }
    }

    /// Mark this request as streaming: sets `stream = "chunks"` and the
    /// `X-Relay-Stream` header the relay keys on.
    pub fn streaming(mut self) -> Self {
        self.stream = Some("chunks".into());
        self.headers.insert(STREAM_HEADER.into(), "chunks".into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Outbound `http.request` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub event: String,
    pub id: String,
    pub req: RelayHttpRequest,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, req: RelayHttpRequest) -> Self {
        Self {
            event: EVENT_HTTP_REQUEST.into(),
            id: id.into(),
            req,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Single (non-streamed) response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseBody {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub body_b64: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseBody {
    /// Decode the raw body, if one was carried.
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, RelayError> {
        match &self.body_b64 {
            Some(b64) => Ok(Some(
                base64::engine::general_purpose::STANDARD.decode(b64)?,
            )),
            None => Ok(None),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// `relay.response.begin` metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BeginBody {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
}

/// `relay.response.chunk` — one raw body segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkBody {
    pub id: String,
    pub seq: u64,
    pub b64: String,
}

impl ChunkBody {
    pub fn decode(&self) -> Result<Vec<u8>, RelayError> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.b64)?)
    }
}

/// One pre-split line inside a `relay.response.lines` batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayLine {
    pub seq: u64,
    #[serde(default)]
    pub ts: Option<i64>,
    pub line: String,
}

/// `relay.response.lines` — a batch of NDJSON/SSE lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinesBody {
    pub id: String,
    pub lines: Vec<RelayLine>,
}

/// `relay.response.end` — terminal stream frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EndBody {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub last_seq: Option<u64>,
    #[serde(default)]
    pub lines: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub done_seen: Option<bool>,
}

/// `relay.redirect` — the relay declined and points at another peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RedirectBody {
    pub id: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A parsed inbound relay frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum RelayReply {
    #[serde(rename = "relay.response")]
    Response(ResponseBody),
    #[serde(rename = "relay.response.begin")]
    Begin(BeginBody),
    #[serde(rename = "relay.response.chunk")]
    Chunk(ChunkBody),
    #[serde(rename = "relay.response.lines")]
    Lines(LinesBody),
    #[serde(rename = "relay.response.keepalive")]
    Keepalive {
        id: String,
        #[serde(default)]
        ts: Option<i64>,
    },
    #[serde(rename = "relay.response.end")]
    End(EndBody),
    #[serde(rename = "relay.redirect")]
    Redirect(RedirectBody),
}

impl RelayReply {
    /// Parse an inbound datagram. Returns `Ok(None)` for frames that are not
    /// relay replies at all (peer DMs travel on the same transport).
    pub fn parse(value: &Value) -> Result<Option<Self>, RelayError> {
        let event = match value.get("event").and_then(Value::as_str) {
            Some(e) => e,
            None => return Ok(None),
        };
        if !event.starts_with("relay.res") && event != "relay.redirect" {
            return Ok(None);
        }
        if value.get("id").and_then(Value::as_str).is_none() {
            return Err(RelayError::MissingId);
        }
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| RelayError::Malformed {
                event: event.to_string(),
                source,
            })
    }

    /// The correlation id this frame answers.
    pub fn id(&self) -> &str {
        match self {
            RelayReply::Response(b) => &b.id,
            RelayReply::Begin(b) => &b.id,
            RelayReply::Chunk(b) => &b.id,
            RelayReply::Lines(b) => &b.id,
            RelayReply::Keepalive { id, .. } => id,
            RelayReply::End(b) => &b.id,
            RelayReply::Redirect(b) => &b.id,
        }
    }

    /// Whether this frame terminates its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayReply::End(_) | RelayReply::Response(_))
    }
}
