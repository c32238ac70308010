//! Outbound message variants.
//!
//! Every variant turns into exactly one data frame when the connection's
//! writer gets to it. JSON payloads are encoded at that point, not when the
//! caller submits them, so encoding failures surface through the same
//! completion path as transport failures.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::errors::ConnectionError;
use crate::update::ServerUpdate;

/// Kind of data frame a message is written as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// An encoded message, ready for the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Text frame payload.
    Text(String),
    /// Binary frame payload.
    Binary(Bytes),
}

impl OutboundFrame {
    /// Frame kind of this payload.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Text(_) => FrameKind::Text,
            Self::Binary(_) => FrameKind::Binary,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A value that can be encoded as a JSON text frame.
pub trait JsonPayload: Send {
    /// Encode to a JSON string.
    fn encode(&self) -> serde_json::Result<String>;
}

impl<T: Serialize + Send> JsonPayload for T {
    fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A message submitted for writing.
pub enum OutboundMessage {
    /// Text written as a text frame.
    Text(String),
    /// Bytes written as a binary frame.
    Binary(Bytes),
    /// Bytes written as a text frame; must be valid UTF-8.
    BinaryAsText(Bytes),
    /// A value serialized to JSON and written as a text frame.
    Json(Box<dyn JsonPayload>),
}

impl OutboundMessage {
    /// JSON message without an envelope.
    pub fn json<T: Serialize + Send + 'static>(value: T) -> Self {
        Self::Json(Box::new(value))
    }

    /// JSON message wrapped in the `{type, data}` envelope.
    pub fn update<T: Serialize + Send + 'static>(update_type: impl Into<String>, data: T) -> Self {
        Self::json(ServerUpdate::new(update_type, data))
    }

    /// Frame kind this message is written as.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Binary(_) => FrameKind::Binary,
            Self::Text(_) | Self::BinaryAsText(_) | Self::Json(_) => FrameKind::Text,
        }
    }

    /// Produce the frame payload.
    pub fn encode(self) -> Result<OutboundFrame, ConnectionError> {
        match self {
            Self::Text(text) => Ok(OutboundFrame::Text(text)),
            Self::Binary(bytes) => Ok(OutboundFrame::Binary(bytes)),
            Self::BinaryAsText(bytes) => {
                let text = String::from_utf8(bytes.to_vec())?;
                Ok(OutboundFrame::Text(text))
            }
            Self::Json(payload) => payload
                .encode()
                .map(OutboundFrame::Text)
                .map_err(ConnectionError::Encode),
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Self::Binary(bytes) => f.debug_tuple("Binary").field(&bytes.len()).finish(),
            Self::BinaryAsText(bytes) => f.debug_tuple("BinaryAsText").field(&bytes.len()).finish(),
            Self::Json(_) => f.write_str("Json(..)"),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Bytes> for OutboundMessage {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for OutboundMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn text_is_text_frame() {
        let msg = OutboundMessage::from("hello");
        assert_eq!(msg.kind(), FrameKind::Text);
        assert_eq!(msg.encode().unwrap(), OutboundFrame::Text("hello".into()));
    }

    #[test]
    fn binary_is_binary_frame() {
        let msg = OutboundMessage::from(vec![0u8, 159, 146, 150]);
        assert_eq!(msg.kind(), FrameKind::Binary);
        let frame = msg.encode().unwrap();
        assert_eq!(frame.kind(), FrameKind::Binary);
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn binary_as_text_is_text_frame() {
        let msg = OutboundMessage::BinaryAsText(Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(msg.kind(), FrameKind::Text);
        assert_eq!(msg.encode().unwrap(), OutboundFrame::Text("{\"a\":1}".into()));
    }

    #[test]
    fn binary_as_text_rejects_invalid_utf8() {
        let msg = OutboundMessage::BinaryAsText(Bytes::from_static(&[0xff, 0xfe]));
        assert_matches!(msg.encode(), Err(ConnectionError::InvalidText(_)));
    }

    #[test]
    fn update_uses_envelope() {
        let msg = OutboundMessage::update("PONG", ());
        assert_eq!(msg.encode().unwrap(), OutboundFrame::Text(r#"{"type":"PONG"}"#.into()));
    }

    #[test]
    fn json_encoding_failure_is_encode_error() {
        // Non-string map keys cannot be represented in JSON.
        let mut bad = HashMap::new();
        let _ = bad.insert(vec![1u8, 2], "value");
        let msg = OutboundMessage::json(bad);
        assert_matches!(msg.encode(), Err(ConnectionError::Encode(_)));
    }

    #[test]
    fn debug_does_not_dump_payloads() {
        let msg = OutboundMessage::Text("secret".into());
        assert_eq!(format!("{msg:?}"), "Text(6)");
        assert_eq!(format!("{:?}", OutboundMessage::json(1)), "Json(..)");
    }
}
