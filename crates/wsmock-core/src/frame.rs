//! Message frames and payload canonicalisation.
//!
//! A [`MessageFrame`] pairs an [`Opcode`] with a [`Payload`]. The payload
//! variant is decided once, when the frame is built or decoded from the
//! wire, and is never re-sniffed afterwards:
//!
//! - text whose content parses as a JSON object or array becomes
//!   [`Payload::Structured`], any other text stays [`Payload::Text`]
//! - binary, ping and pong payloads stay [`Payload::Binary`]
//!
//! The canonical form of a structured payload is the compact `serde_json`
//! encoding. `serde_json::Map` is `BTreeMap`-backed, so object keys come out
//! sorted and two equal values always produce identical bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MockError, Result};

/// Maximum payload length of a WebSocket control frame (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket data and control opcodes handled by the mock server.
///
/// Close frames are handled by the transport and never surface here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

impl Opcode {
    /// Whether this is a control opcode (ping or pong).
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }

    /// Lowercase name, as used in logs and serialised frames.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame payload, classified once at normalisation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    /// Plain text that is not a JSON object or array.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// A JSON object or array.
    Structured(Value),
}

impl Payload {
    /// Classify a text payload, promoting JSON objects and arrays to
    /// [`Payload::Structured`].
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(value @ (Value::Object(_) | Value::Array(_))) =
                serde_json::from_str::<Value>(&text)
            {
                return Self::Structured(value);
            }
        }
        Self::Text(text)
    }

    /// Classify a JSON value: objects and arrays are structured, a JSON
    /// string becomes plain text and other scalars use their JSON text.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) | Value::Array(_) => Self::Structured(value),
            Value::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }

    /// Deterministic byte encoding used for matching and transmission.
    pub fn canonical(&self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.as_bytes().to_vec(),
            Self::Binary(b) => b.clone(),
            Self::Structured(v) => v.to_string().into_bytes(),
        }
    }

    /// The text content, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The structured value, if this is a structured payload.
    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }

    /// The raw bytes, if this is a binary payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// Frame as handed to or received from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    /// Text frame content.
    Text(String),
    /// Binary frame content.
    Binary(Vec<u8>),
    /// Ping payload.
    Ping(Vec<u8>),
    /// Pong payload.
    Pong(Vec<u8>),
}

/// A single WebSocket message: opcode plus payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    /// Frame opcode.
    pub opcode: Opcode,
    /// Frame payload.
    pub payload: Payload,
}

impl MessageFrame {
    /// Build a frame from its parts.
    pub fn new(opcode: Opcode, payload: Payload) -> Self {
        Self { opcode, payload }
    }

    /// Text frame; JSON objects and arrays become structured payloads.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, Payload::from_text(text))
    }

    /// Binary frame.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, Payload::Binary(bytes.into()))
    }

    /// Ping frame.
    pub fn ping(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, Payload::Binary(bytes.into()))
    }

    /// Pong frame.
    pub fn pong(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, Payload::Binary(bytes.into()))
    }

    /// Text frame carrying a structured value.
    pub fn structured(value: Value) -> Self {
        Self::new(Opcode::Text, Payload::from_value(value))
    }

    /// Frame carrying any serialisable value.
    ///
    /// Fails with [`MockError::InvalidPayload`] when the value cannot be
    /// represented as JSON.
    pub fn json<T: Serialize + ?Sized>(opcode: Opcode, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(Self::new(opcode, Payload::from_value(value)))
    }

    /// Decode a transport frame, classifying its payload once.
    pub fn decode(wire: WireFrame) -> Self {
        match wire {
            WireFrame::Text(s) => Self::text(s),
            WireFrame::Binary(b) => Self::binary(b),
            WireFrame::Ping(b) => Self::ping(b),
            WireFrame::Pong(b) => Self::pong(b),
        }
    }

    /// Encode for transmission, validating the payload against the opcode.
    pub fn encode(&self) -> Result<WireFrame> {
        let bytes = self.payload.canonical();
        match self.opcode {
            Opcode::Text => match &self.payload {
                Payload::Text(s) => Ok(WireFrame::Text(s.clone())),
                Payload::Structured(v) => Ok(WireFrame::Text(v.to_string())),
                Payload::Binary(_) => String::from_utf8(bytes)
                    .map(WireFrame::Text)
                    .map_err(|e| {
                        MockError::InvalidPayload(format!("text frame is not valid UTF-8: {e}"))
                    }),
            },
            Opcode::Binary => Ok(WireFrame::Binary(bytes)),
            Opcode::Ping | Opcode::Pong => {
                if bytes.len() > MAX_CONTROL_PAYLOAD {
                    return Err(MockError::InvalidPayload(format!(
                        "{} payload is {} bytes, control frames allow at most {MAX_CONTROL_PAYLOAD}",
                        self.opcode,
                        bytes.len()
                    )));
                }
                if self.opcode == Opcode::Ping {
                    Ok(WireFrame::Ping(bytes))
                } else {
                    Ok(WireFrame::Pong(bytes))
                }
            }
        }
    }

    /// `(opcode, canonical payload)` key used by exact reply rules.
    pub fn canonical_key(&self) -> (Opcode, Vec<u8>) {
        (self.opcode, self.payload.canonical())
    }

    /// The text content when this is a plain text frame.
    pub fn as_text(&self) -> Option<&str> {
        if self.opcode == Opcode::Text {
            self.payload.as_text()
        } else {
            None
        }
    }
}

impl From<&str> for MessageFrame {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for MessageFrame {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Value> for MessageFrame {
    fn from(value: Value) -> Self {
        Self::structured(value)
    }
}

impl From<Vec<u8>> for MessageFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::binary(bytes)
    }
}

impl From<&[u8]> for MessageFrame {
    fn from(bytes: &[u8]) -> Self {
        Self::binary(bytes)
    }
}

impl From<(Opcode, Payload)> for MessageFrame {
    fn from((opcode, payload): (Opcode, Payload)) -> Self {
        Self::new(opcode, payload)
    }
}

impl From<(Opcode, &str)> for MessageFrame {
    fn from((opcode, text): (Opcode, &str)) -> Self {
        match opcode {
            Opcode::Text => Self::text(text),
            other => Self::new(other, Payload::Binary(text.as_bytes().to_vec())),
        }
    }
}

impl From<(Opcode, String)> for MessageFrame {
    fn from((opcode, text): (Opcode, String)) -> Self {
        match opcode {
            Opcode::Text => Self::text(text),
            other => Self::new(other, Payload::Binary(text.into_bytes())),
        }
    }
}
