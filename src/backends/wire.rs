//! Backend wire contract.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! object. Outbound frames are always `chat_message`; inbound frames are
//! classified into [`Inbound`] so the correlator only ever sees tagged
//! variants.
//!
//! Inbound shapes accepted:
//!
//! | `kind`                                       | Meaning                         |
//! |----------------------------------------------|---------------------------------|
//! | absent, `*_response`, anything else          | unary answer (`response`, `content` or `message`) |
//! | `chunk`                                      | streaming piece (`content`)     |
//! | `end`                                        | stream finished                 |
//! | `error`                                      | backend-side failure            |
//! | `capabilities`                               | capability report               |
//! | `ping`, `pong`, `heartbeat`, `welcome`       | keep-alive, ignored             |

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::LengthDelimitedCodec;

use crate::core::error::AggregatorError;

pub const KIND_CHAT_MESSAGE: &str = "chat_message";
pub const AGGREGATOR_SOURCE: &str = "aggregator";

/// Largest frame accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KEEPALIVE_KINDS: &[&str] = &["ping", "pong", "heartbeat", "welcome"];

/// Length-delimited codec shared by the connection task and test backends.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Aggregator → backend request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub kind: String,
    pub message: String,
    pub correlation_id: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub source: String,
}

impl OutboundFrame {
    pub fn chat(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            kind: KIND_CHAT_MESSAGE.to_string(),
            message: message.into(),
            correlation_id: correlation_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: AGGREGATOR_SOURCE.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, AggregatorError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| AggregatorError::MalformedFrame(format!("encode failed: {e}")))
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// A complete answer from one backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    pub text: String,
    pub capabilities: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }
}

/// Tagged body of a frame addressed to a pending request.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Unary(BackendReply),
    Chunk { content: String },
    End,
    Error { message: String },
}

impl FrameBody {
    pub fn label(&self) -> &'static str {
        match self {
            FrameBody::Unary(_) => "unary",
            FrameBody::Chunk { .. } => "chunk",
            FrameBody::End => "end",
            FrameBody::Error { .. } => "error",
        }
    }
}

/// A frame addressed to a pending request, with or without a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub correlation_id: Option<String>,
    pub body: FrameBody,
}

/// Result of classifying one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(InboundFrame),
    Capabilities(Vec<String>),
    /// Keep-alives and unknown kinds without usable content.
    Ignored { kind: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    #[serde(default, alias = "correlation_id")]
    correlation_id: Option<String>,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

fn value_text(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Parse and classify one inbound payload.
pub fn decode(payload: &[u8]) -> Result<Inbound, AggregatorError> {
    let raw: RawInbound = serde_json::from_slice(payload)
        .map_err(|e| AggregatorError::MalformedFrame(e.to_string()))?;

    let correlation_id = raw.correlation_id.filter(|id| !id.is_empty());
    let kind = raw.kind.unwrap_or_default();

    let body = match kind.as_str() {
        "chunk" => FrameBody::Chunk {
            content: raw.content.and_then(value_text).unwrap_or_default(),
        },
        "end" => FrameBody::End,
        "error" => FrameBody::Error {
            message: raw
                .error
                .or(raw.message)
                .and_then(value_text)
                .unwrap_or_else(|| "unspecified backend error".to_string()),
        },
        "capabilities" => {
            return Ok(Inbound::Capabilities(raw.capabilities.unwrap_or_default()));
        }
        k if KEEPALIVE_KINDS.contains(&k) => {
            return Ok(Inbound::Ignored { kind });
        }
        _ => {
            let text = raw
                .response
                .and_then(value_text)
                .or_else(|| raw.content.and_then(value_text))
                .or_else(|| raw.message.and_then(value_text));
            match text {
                Some(text) => FrameBody::Unary(BackendReply {
                    text,
                    capabilities: raw.capabilities.unwrap_or_default(),
                    metadata: raw.metadata.unwrap_or_default(),
                }),
                None if kind.is_empty() || kind.ends_with("_response") => {
                    return Err(AggregatorError::MalformedFrame(
                        "unary frame without response, content or message".into(),
                    ));
                }
                None => return Ok(Inbound::Ignored { kind }),
            }
        }
    };

    Ok(Inbound::Frame(InboundFrame { correlation_id, body }))
}
