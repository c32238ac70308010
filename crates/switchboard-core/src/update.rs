//! Update envelope: the `{type, data, extra}` wire wrapper for typed messages.
//!
//! Inbound frames are parsed into [`Update`]; outbound typed writes are
//! serialized from [`ServerUpdate`]. Raw text/binary writes bypass both.

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::ConnectionError;

/// Inbound envelope.
///
/// `type` defaults to the empty string when missing so that a well-formed
/// JSON object without a type is reported as [`ConnectionError::EmptyUpdateType`]
/// rather than a decode failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Update type used for handler lookup.
    #[serde(rename = "type", default)]
    pub update_type: String,
    /// Opaque payload, decoded lazily by the typed handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Optional free-form string carried alongside the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl Update {
    /// Parse a frame into an envelope.
    ///
    /// Fails with [`ConnectionError::Decode`] on malformed JSON and with
    /// [`ConnectionError::EmptyUpdateType`] when `type` is missing or empty.
    pub fn parse(frame: &[u8]) -> Result<Self, ConnectionError> {
        let update: Self = serde_json::from_slice(frame).map_err(ConnectionError::Decode)?;
        if update.update_type.is_empty() {
            return Err(ConnectionError::EmptyUpdateType);
        }
        Ok(update)
    }

    /// Decode `data` into the handler's input shape.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ConnectionError> {
        decode_data(self.data.clone())
    }
}

/// Decode an envelope payload. A missing payload decodes as JSON `null`.
pub fn decode_data<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ConnectionError> {
    serde_json::from_value(data.unwrap_or(Value::Null)).map_err(ConnectionError::Decode)
}

/// Marker input for handlers that take no payload.
///
/// Deserializes from anything, so the frame's `data` is never inspected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmptyInput;

impl<'de> Deserialize<'de> for EmptyInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _ = deserializer.deserialize_ignored_any(IgnoredAny)?;
        Ok(Self)
    }
}

/// Outbound envelope.
///
/// `data` is omitted from the wire when it serializes to `null`, so
/// `ServerUpdate::new("PONG", ())` encodes as `{"type":"PONG"}`.
#[derive(Clone, Debug)]
pub struct ServerUpdate<T> {
    /// Update type.
    pub update_type: String,
    /// Payload.
    pub data: T,
    /// Optional extra string.
    pub extra: Option<String>,
}

impl<T> ServerUpdate<T> {
    /// Create an envelope without `extra`.
    pub fn new(update_type: impl Into<String>, data: T) -> Self {
        Self {
            update_type: update_type.into(),
            data,
            extra: None,
        }
    }

    /// Attach an `extra` string.
    #[must_use]
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }
}

impl<T: Serialize> Serialize for ServerUpdate<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = serde_json::to_value(&self.data).map_err(S::Error::custom)?;
        let len = 1 + usize::from(!data.is_null()) + usize::from(self.extra.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("type", &self.update_type)?;
        if !data.is_null() {
            map.serialize_entry("data", &data)?;
        }
        if let Some(extra) = &self.extra {
            map.serialize_entry("extra", extra)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i64,
    }

    #[test]
    fn parse_full_envelope() {
        let update = Update::parse(br#"{"type":"PING","data":{"x":1},"extra":"e"}"#).unwrap();
        assert_eq!(update.update_type, "PING");
        assert_eq!(update.data, Some(json!({"x": 1})));
        assert_eq!(update.extra.as_deref(), Some("e"));
    }

    #[test]
    fn missing_type_is_empty_update_type() {
        let err = Update::parse(br#"{"data":{"x":1}}"#).unwrap_err();
        assert_matches!(err, ConnectionError::EmptyUpdateType);
    }

    #[test]
    fn blank_type_is_empty_update_type() {
        let err = Update::parse(br#"{"type":""}"#).unwrap_err();
        assert_matches!(err, ConnectionError::EmptyUpdateType);
    }

    #[test]
    fn malformed_json_is_decode_error() {
        assert_matches!(Update::parse(b"not json"), Err(ConnectionError::Decode(_)));
        assert_matches!(Update::parse(b"null"), Err(ConnectionError::Decode(_)));
        assert_matches!(Update::parse(b"[1,2]"), Err(ConnectionError::Decode(_)));
    }

    #[test]
    fn decode_typed_payload() {
        let update = Update::parse(br#"{"type":"MOVE","data":{"x":7}}"#).unwrap();
        let point: Point = update.decode_data().unwrap();
        assert_eq!(point, Point { x: 7 });
    }

    #[test]
    fn decode_missing_payload_into_struct_fails() {
        let update = Update::parse(br#"{"type":"MOVE"}"#).unwrap();
        assert_matches!(update.decode_data::<Point>(), Err(ConnectionError::Decode(_)));
    }

    #[test]
    fn empty_input_accepts_anything() {
        assert_eq!(decode_data::<EmptyInput>(None).unwrap(), EmptyInput);
        assert_eq!(
            decode_data::<EmptyInput>(Some(json!({"ignored": [1, 2, 3]}))).unwrap(),
            EmptyInput
        );
        assert_eq!(decode_data::<EmptyInput>(Some(json!("text"))).unwrap(), EmptyInput);
    }

    #[test]
    fn server_update_omits_null_data() {
        let json = serde_json::to_string(&ServerUpdate::new("PONG", ())).unwrap();
        assert_eq!(json, r#"{"type":"PONG"}"#);
        let json = serde_json::to_string(&ServerUpdate::new("PONG", None::<u8>)).unwrap();
        assert_eq!(json, r#"{"type":"PONG"}"#);
    }

    #[test]
    fn server_update_with_data_and_extra() {
        let update = ServerUpdate::new("client_id", "abc").with_extra("hint");
        let value: Value = serde_json::to_value(&update).unwrap();
        assert_eq!(value, json!({"type": "client_id", "data": "abc", "extra": "hint"}));
    }

    #[test]
    fn server_update_parses_back_as_update() {
        let json = serde_json::to_vec(&ServerUpdate::new("ROOM", json!({"id": 42}))).unwrap();
        let update = Update::parse(&json).unwrap();
        assert_eq!(update.update_type, "ROOM");
        assert_eq!(update.data, Some(json!({"id": 42})));
        assert!(update.extra.is_none());
    }
}
