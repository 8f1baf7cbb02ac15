//! Frames carried on the chat event stream.
//!
//! Every frame travels as one SSE `data:` line holding a JSON object tagged by
//! `type`. `connected` and `heartbeat` are control frames: they only signal
//! liveness and are never persisted or handed to business logic.

use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Sent once when a subscription is accepted.
    Connected,
    /// Sent on a fixed interval to keep intermediaries from idling the stream out.
    Heartbeat,
    NewMessage { message: ChatMessage },
}

impl StreamFrame {
    pub fn new_message(message: ChatMessage) -> Self {
        StreamFrame::NewMessage { message }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, StreamFrame::Connected | StreamFrame::Heartbeat)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StreamFrame::Connected => "connected",
            StreamFrame::Heartbeat => "heartbeat",
            StreamFrame::NewMessage { .. } => "new_message",
        }
    }
}

/// Serialized form of [`StreamFrame::Connected`].
pub const CONNECTED_JSON: &str = r#"{"type":"connected"}"#;

/// Serialized form of [`StreamFrame::Heartbeat`].
pub const HEARTBEAT_JSON: &str = r#"{"type":"heartbeat"}"#;

/// Wraps a JSON payload in the SSE wire format: `data: <json>\n\n`.
pub fn encode_sse(json: &str) -> String {
    format!("data: {json}\n\n")
}
