//! Serializer Capability
//!
//! The transport never looks inside a payload. It only needs a way to turn a
//! value into bytes and back, which is what [`Serializer`] describes. The
//! serializer is injected through
//! [`ConnectionParameters`](crate::ConnectionParameters) on the client side
//! and [`Server::new`](crate::Server::new) on the server side.
//!
//! # Polymorphic payloads
//!
//! The receiver does not need to know which concrete message was sent as long
//! as the encoded form names it. With [`JsonSerializer`] that is done with a
//! serde tag:
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! #[serde(tag = "$type")]
//! enum Command {
//!     Open { path: String },
//!     Close,
//! }
//! ```
//!
//! encodes `Command::Close` as `{"$type":"Close"}` and the receiving side
//! reconstructs the right variant from that tag alone.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors raised while converting between values and payload bytes
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The value could not be encoded
    #[error("{codec} encode failed: {message}")]
    Encode {
        /// Name of the serializer that failed
        codec: &'static str,
        /// Description from the underlying codec
        message: String,
    },

    /// The payload could not be decoded into the expected type
    #[error("{codec} decode failed: {message}")]
    Decode {
        /// Name of the serializer that failed
        codec: &'static str,
        /// Description from the underlying codec
        message: String,
    },
}

/// Converts values to payload bytes and back
///
/// `to_bytes` must report unencodable input as an error instead of panicking.
/// `from_bytes` returns `Ok(None)` when the payload carries no value; the
/// transport drops such frames silently.
pub trait Serializer: Send + Sync + 'static {
    /// Short codec name used in logs and errors
    fn name(&self) -> &'static str;

    /// Encode a value into payload bytes
    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    /// Decode payload bytes into a value of type `T`
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8])
        -> Result<Option<T>, SerializationError>;
}

/// UTF-8 JSON serializer (the default)
///
/// An empty payload and a JSON `null` both decode to `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Create a new JSON serializer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            codec: self.name(),
            message: e.to_string(),
        })
    }

    fn from_bytes<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<Option<T>, SerializationError> {
        if bytes.is_empty() {
            return Ok(None);
        }

        // `null` maps to None through the Option wrapper
        serde_json::from_slice::<Option<T>>(bytes).map_err(|e| SerializationError::Decode {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

/// Compact binary serializer backed by `bincode`
///
/// Smaller and faster than JSON, but the encoding is not self-describing:
/// both peers must agree on the message type.
#[cfg(feature = "bincode")]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinarySerializer;

#[cfg(feature = "bincode")]
impl BinarySerializer {
    /// Create a new binary serializer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "bincode")]
impl Serializer for BinarySerializer {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        bincode::serialize(value).map_err(|e| SerializationError::Encode {
            codec: self.name(),
            message: e.to_string(),
        })
    }

    fn from_bytes<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<Option<T>, SerializationError> {
        if bytes.is_empty() {
            return Ok(None);
        }

        bincode::deserialize(bytes)
            .map(Some)
            .map_err(|e| SerializationError::Decode {
                codec: self.name(),
                message: e.to_string(),
            })
    }
}

/// MessagePack serializer backed by `rmp-serde`
///
/// Structs are written as maps with field names, so peers in other
/// languages can decode them without a schema.
#[cfg(feature = "msgpack")]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessagePackSerializer;

#[cfg(feature = "msgpack")]
impl MessagePackSerializer {
    /// Create a new MessagePack serializer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "msgpack")]
impl Serializer for MessagePackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(value).map_err(|e| SerializationError::Encode {
            codec: self.name(),
            message: e.to_string(),
        })
    }

    fn from_bytes<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<Option<T>, SerializationError> {
        if bytes.is_empty() {
            return Ok(None);
        }

        rmp_serde::from_slice::<Option<T>>(bytes).map_err(|e| SerializationError::Decode {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "$type")]
    enum Shape {
        Circle { radius: f64 },
        Rect { width: u32, height: u32 },
        Empty,
    }

    #[test]
    fn test_json_tagged_roundtrip() {
        let json = JsonSerializer::new();
        let shapes = vec![
            Shape::Circle { radius: 1.5 },
            Shape::Rect {
                width: 3,
                height: 4,
            },
            Shape::Empty,
        ];

        for shape in shapes {
            let bytes = json.to_bytes(&shape).unwrap();
            let decoded: Shape = json.from_bytes(&bytes).unwrap().unwrap();
            assert_eq!(decoded, shape);
        }
    }

    #[test]
    fn test_json_encoding_names_the_variant() {
        let json = JsonSerializer::new();
        let bytes = json.to_bytes(&Shape::Empty).unwrap();
        assert_eq!(bytes, br#"{"$type":"Empty"}"#);
    }

    #[test]
    fn test_json_empty_and_null_decode_to_none() {
        let json = JsonSerializer::new();
        assert!(json.from_bytes::<Shape>(&[]).unwrap().is_none());
        assert!(json.from_bytes::<Shape>(b"null").unwrap().is_none());
    }

    #[test]
    fn test_json_unknown_tag_is_decode_error() {
        let json = JsonSerializer::new();
        let result = json.from_bytes::<Shape>(br#"{"$type":"Triangle"}"#);
        assert!(matches!(result, Err(SerializationError::Decode { codec: "json", .. })));
    }

    #[test]
    fn test_json_invalid_utf8_is_decode_error() {
        let json = JsonSerializer::new();
        let result = json.from_bytes::<String>(&[0xff, 0xfe, 0xfd]);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_non_string_map_keys_fail_gracefully() {
        use std::collections::HashMap;

        let json = JsonSerializer::new();
        let mut map = HashMap::new();
        map.insert((1u8, 2u8), "tuple keys are not valid JSON object keys");

        let result = json.to_bytes(&map);
        assert!(matches!(result, Err(SerializationError::Encode { .. })));
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_binary_roundtrip() {
        let binary = BinarySerializer::new();
        let value = vec![String::from("alpha"), String::from("beta")];

        let bytes = binary.to_bytes(&value).unwrap();
        let decoded: Vec<String> = binary.from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(decoded, value);
        assert!(binary.from_bytes::<String>(&[]).unwrap().is_none());
    }

    #[test]
    fn test_json_whitespace_around_string() {
        let json = JsonSerializer::new();
        let decoded: String = json.from_bytes(b"  \"padded\"\n").unwrap().unwrap();
        assert_eq!(decoded, "padded");
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn test_msgpack_tagged_roundtrip() {
        let msgpack = MessagePackSerializer::new();
        let shape = Shape::Rect {
            width: 7,
            height: 2,
        };

        let bytes = msgpack.to_bytes(&shape).unwrap();
        let decoded: Shape = msgpack.from_bytes(&bytes).unwrap().unwrap();
        assert_eq!(decoded, shape);
        assert!(msgpack.from_bytes::<Shape>(&[]).unwrap().is_none());
        assert!(matches!(
            msgpack.from_bytes::<Shape>(&[0xc1]),
            Err(SerializationError::Decode { codec: "msgpack", .. })
        ));
    }
}
