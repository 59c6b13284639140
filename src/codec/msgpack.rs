//! MsgPack codec using `rmp-serde`.
//!
//! Always `to_vec_named`: envelopes are maps keyed by field name, the same
//! shape as the JSON form, so optional fields such as `correlationId` can be
//! skipped. The positional array layout produced by `to_vec` cannot do that.

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        topic_id: String,
        response_required: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Probe {
            topic_id: "0.0.1001".to_string(),
            response_required: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Probe = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_to_vec_named_produces_map_format() {
        let probe = Probe {
            topic_id: "0.0.1".to_string(),
            response_required: false,
        };

        let encoded = MsgPackCodec::encode(&probe).unwrap();

        // fixmap with 2 entries, not fixarray (0x92)
        assert_eq!(encoded[0], 0x82, "Expected map format, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_free_form_value_survives() {
        let value = serde_json::json!({"echo": {"msg": "hi"}, "n": 7, "list": [1, -2, 3.5]});
        let encoded = MsgPackCodec::encode(&value).unwrap();
        let decoded: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Probe> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }
}
