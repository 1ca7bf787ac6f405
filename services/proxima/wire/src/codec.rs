//! Encoding and decoding of single records.
//!
//! A record is an untyped key-value payload: a JSON object. Everything that
//! flows through an adapter pipeline is a [`Record`].

use crate::error::WireError;
use crate::frame::DELIMITER;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

/// Untyped structured payload carried by every adapter
pub type Record = serde_json::Map<String, Value>;

/// Encode a record as one delimited line (compact JSON followed by `\n`)
pub fn encode_record(record: &Record) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(record)?;
    let mut buf = BytesMut::with_capacity(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(DELIMITER);
    Ok(buf.freeze())
}

/// Parse one complete record from its text form
///
/// Surrounding whitespace is ignored. Anything other than a JSON object is
/// rejected, so a bare number or array never reaches a pipeline.
pub fn parse_record(text: &str) -> Result<Record, WireError> {
    match serde_json::from_str::<Value>(text.trim())? {
        Value::Object(map) => Ok(map),
        Value::Null => Err(WireError::NotAnObject("null")),
        Value::Bool(_) => Err(WireError::NotAnObject("bool")),
        Value::Number(_) => Err(WireError::NotAnObject("number")),
        Value::String(_) => Err(WireError::NotAnObject("string")),
        Value::Array(_) => Err(WireError::NotAnObject("array")),
    }
}

/// Parse one complete record from raw bytes
pub fn parse_record_bytes(raw: &[u8]) -> Result<Record, WireError> {
    parse_record(std::str::from_utf8(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_encode_appends_single_delimiter() {
        let bytes = encode_record(&record(json!({"a": 1}))).unwrap();
        assert_eq!(&bytes[..], b"{\"a\":1}\n");
    }

    #[test]
    fn test_encode_escapes_embedded_newlines() {
        let bytes = encode_record(&record(json!({"text": "line one\nline two"}))).unwrap();

        // Exactly one raw delimiter, at the very end
        let delimiters = bytes.iter().filter(|b| **b == DELIMITER).count();
        assert_eq!(delimiters, 1);
        assert_eq!(bytes.last(), Some(&DELIMITER));
    }

    #[test]
    fn test_parse_object() {
        let parsed = parse_record("  {\"a\":2}  ").unwrap();
        assert_eq!(parsed, record(json!({"a": 2})));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(parse_record("[1,2]"), Err(WireError::NotAnObject("array"))));
        assert!(matches!(parse_record("42"), Err(WireError::NotAnObject("number"))));
        assert!(matches!(parse_record("{\"a\":"), Err(WireError::Json(_))));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        assert!(matches!(
            parse_record_bytes(&[0x7b, 0xff, 0x7d]),
            Err(WireError::Utf8(_))
        ));
    }
}
