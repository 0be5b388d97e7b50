//! JSON codec using `serde_json`.
//!
//! This is the default envelope format: peers built around text-based JSON
//! serializers parse it without any extra schema.

use crate::error::Result;

/// JSON codec for structured data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to compact UTF-8 JSON.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Decode UTF-8 JSON bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Score {
        player: String,
        points: i64,
    }

    #[test]
    fn test_encode_is_compact() {
        let encoded = JsonCodec::encode(&Score {
            player: "a".to_string(),
            points: 3,
        })
        .unwrap();
        assert_eq!(encoded, br#"{"player":"a","points":3}"#);
    }

    #[test]
    fn test_decode_struct() {
        let decoded: Score = JsonCodec::decode(br#"{"points":-1,"player":"b"}"#).unwrap();
        assert_eq!(
            decoded,
            Score {
                player: "b".to_string(),
                points: -1
            }
        );
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Score> = JsonCodec::decode(b"\xff not json");
        assert!(result.is_err());
    }
}
