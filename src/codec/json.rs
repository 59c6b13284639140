//! JSON codec using `serde_json`.
//!
//! This is the interoperable format: peers written against the JSON
//! envelope schema publish exactly these bytes on the topic.

use crate::error::Result;

/// JSON codec for structured data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to compact JSON bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode JSON bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_encode_is_compact() {
        let mut map = HashMap::new();
        map.insert("a", 1);
        let encoded = JsonCodec::encode(&map).unwrap();
        assert_eq!(encoded, br#"{"a":1}"#);
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let result: Result<serde_json::Value> = JsonCodec::decode(br#"{"id": "abc""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_utf8_payload() {
        let decoded: String = JsonCodec::decode("\"héllo\"".as_bytes()).unwrap();
        assert_eq!(decoded, "héllo");
    }
}
