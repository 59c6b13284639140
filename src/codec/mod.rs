//! Codec module - serialization of envelopes for the topic.
//!
//! - [`JsonCodec`] - JSON via `serde_json` (default, interoperable)
//! - [`MsgPackCodec`] - MessagePack via `rmp-serde` (`to_vec_named`)
//!
//! Codecs are marker structs with static methods. [`WireFormat`] picks one at
//! runtime so a client can be configured without generics.
//!
//! # Example
//!
//! ```
//! use hcs10_client::codec::{JsonCodec, MsgPackCodec};
//!
//! let encoded = JsonCodec::encode(&"hello").unwrap();
//! let decoded: String = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let encoded = MsgPackCodec::encode(&42u32).unwrap();
//! let decoded: u32 = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, 42);
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::Result;

/// Byte encoding used for envelopes on the topic.
///
/// Every participant on a topic must agree on the format; a message in the
/// other format is dropped as malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// MessagePack, struct-as-map.
    MsgPack,
}

impl WireFormat {
    /// Encode a value in this format.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireFormat::Json => JsonCodec::encode(value),
            WireFormat::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a value in this format.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            WireFormat::Json => JsonCodec::decode(bytes),
            WireFormat::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}
