use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{Map, Value};
use std::io::Cursor;

use crate::{code_to_name, name_to_code, HEADER_LEN};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame shorter than the {HEADER_LEN}-byte header")]
    MalformedFrame,
    #[error("frame declares {declared} payload bytes but only {available} are present")]
    TruncatedFrame { declared: u32, available: usize },
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("textual JSON message has no \"type\" field")]
    MissingType,
}

/// Result of decoding a frame: the wire type name, the frame timestamp,
/// the payload itself, and every field of the payload hoisted to the
/// top level for compatibility with clients that read flat messages.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub message_type: String,
    pub timestamp: i64,
    pub payload: Value,
    pub fields: Map<String, Value>,
}

/// Encodes a message as a binary frame: 1-byte type code, 8-byte
/// big-endian signed timestamp, 4-byte big-endian payload length, then
/// the UTF-8 JSON payload. An unknown `type_name` encodes with the
/// `error` type code (0xFF) rather than failing.
#[must_use]
pub fn encode_message(type_name: &str, payload: &Value, timestamp: i64) -> Vec<u8> {
    let payload_bytes = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_bytes.len());
    buf.write_u8(name_to_code(type_name)).expect("write to Vec cannot fail");
    buf.write_i64::<BigEndian>(timestamp).expect("write to Vec cannot fail");
    buf.write_u32::<BigEndian>(payload_bytes.len() as u32)
        .expect("write to Vec cannot fail");
    buf.extend_from_slice(&payload_bytes);
    buf
}

/// Decodes a frame, falling back to textual JSON parsing when the first
/// byte looks like the start of a JSON object or array.
pub fn decode_message(data: &[u8]) -> Result<DecodedMessage, CodecError> {
    if let Some(&first) = data.first() {
        if first == b'{' || first == b'[' {
            return decode_textual(data);
        }
    }
    decode_binary(data)
}

fn decode_binary(data: &[u8]) -> Result<DecodedMessage, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::MalformedFrame);
    }
    let mut cursor = Cursor::new(data);
    let type_code = cursor.read_u8().expect("length checked above");
    let timestamp = cursor.read_i64::<BigEndian>().expect("length checked above");
    let declared_len = cursor.read_u32::<BigEndian>().expect("length checked above");

    let header_end = cursor.position() as usize;
    let available = data.len() - header_end;
    if declared_len as usize > available {
        return Err(CodecError::TruncatedFrame {
            declared: declared_len,
            available,
        });
    }

    let payload_bytes = &data[header_end..header_end + declared_len as usize];
    let payload: Value = if payload_bytes.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(payload_bytes)?
    };
    let fields = payload.as_object().cloned().unwrap_or_default();

    Ok(DecodedMessage {
        message_type: code_to_name(type_code).to_string(),
        timestamp,
        payload,
        fields,
    })
}

fn decode_textual(data: &[u8]) -> Result<DecodedMessage, CodecError> {
    let value: Value = serde_json::from_slice(data)?;
    let mut object = match value {
        Value::Object(map) => map,
        other => {
            let mut wrapper = Map::new();
            wrapper.insert("payload".to_string(), other);
            wrapper
        }
    };

    let message_type = object
        .remove("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or(CodecError::MissingType)?;
    let timestamp = object
        .remove("timestamp")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let payload_value = match object.remove("payload") {
        Some(p) => p,
        None => Value::Object(object),
    };
    let fields = payload_value.as_object().cloned().unwrap_or_default();

    Ok(DecodedMessage {
        message_type,
        timestamp,
        payload: payload_value,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_round_trip_preserves_type_timestamp_and_payload() {
        let payload = json!({"documentId": "doc-1", "changes": {"a": 1}});
        let frame = encode_message(crate::message_type::DELTA, &payload, 1_700_000_000);
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.message_type, crate::message_type::DELTA);
        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.fields.get("documentId").unwrap(), "doc-1");
    }

    #[test]
    fn negative_timestamp_round_trips() {
        let payload = json!({});
        let frame = encode_message(crate::message_type::PING, &payload, -5);
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.timestamp, -5);
    }

    #[test]
    fn frame_shorter_than_header_is_malformed() {
        let err = decode_message(&[0x30, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame));
    }

    #[test]
    fn declared_length_past_buffer_end_is_truncated() {
        let mut frame = encode_message(crate::message_type::PING, &json!({}), 0);
        // inflate the declared length field without adding bytes
        frame[9] = 0xFF;
        let err = decode_message(&frame).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedFrame { .. }));
    }

    #[test]
    fn invalid_payload_json_is_reported() {
        let mut frame = encode_message(crate::message_type::PING, &json!({}), 0);
        frame.truncate(HEADER_LEN);
        frame.extend_from_slice(b"not json");
        frame[9..13].copy_from_slice(&8u32.to_be_bytes());
        let err = decode_message(&frame).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_type_code_decodes_to_error_sentinel_without_panicking() {
        let mut frame = encode_message(crate::message_type::PING, &json!({}), 0);
        frame[0] = 0x77;
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.message_type, crate::message_type::ERROR);
    }

    #[test]
    fn textual_fallback_parses_json_object_with_type_field() {
        let text = br#"{"type":"subscribe","documentId":"doc-7"}"#;
        let decoded = decode_message(text).unwrap();
        assert_eq!(decoded.message_type, "subscribe");
        assert_eq!(decoded.fields.get("documentId").unwrap(), "doc-7");
    }

    #[test]
    fn textual_fallback_without_type_field_errors() {
        let text = br#"{"documentId":"doc-7"}"#;
        let err = decode_message(text).unwrap_err();
        assert!(matches!(err, CodecError::MissingType));
    }

    #[test]
    fn empty_payload_decodes_to_empty_object() {
        let frame = encode_message(crate::message_type::PING, &json!({}), 0);
        let decoded = decode_message(&frame).unwrap();
        assert_eq!(decoded.payload, json!({}));
        assert!(decoded.fields.is_empty());
    }
}
