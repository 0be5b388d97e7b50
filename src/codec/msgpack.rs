//! MessagePack body encoding for envelopes.
//!
//! Always `to_vec_named`: structs go out as maps keyed by field name, so the
//! envelope's `message`/`body` fields are addressable by name on both sides.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use sessionwire::codec::MsgPackCodec;
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Spawn {
//!     entity: u32,
//!     kind: String,
//! }
//!
//! let spawn = Spawn { entity: 42, kind: "crate".into() };
//! let bytes = MsgPackCodec::encode(&spawn)?;
//! assert_eq!(MsgPackCodec::decode::<Spawn>(&bytes)?, spawn);
//! # Ok::<(), sessionwire::SessionwireError>(())
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub struct MsgPackCodec;

impl MsgPackCodec {
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(Into::into)
    }

    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Inventory {
        owner: u32,
        items: Vec<String>,
        equipped: Option<String>,
    }

    #[test]
    fn test_struct_encodes_as_map() {
        let inv = Inventory {
            owner: 1,
            items: vec!["sword".to_string()],
            equipped: None,
        };

        let encoded = MsgPackCodec::encode(&inv).unwrap();

        // fixmap with 3 entries, not fixarray (0x93)
        assert_eq!(encoded[0], 0x83);
        let decoded: Inventory = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, inv);
    }

    #[test]
    fn test_decode_into_dynamic_value() {
        let inv = Inventory {
            owner: 7,
            items: vec![],
            equipped: Some("shield".to_string()),
        };

        let encoded = MsgPackCodec::encode(&inv).unwrap();
        let value: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(value["owner"], 7);
        assert_eq!(value["equipped"], "shield");
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let result: Result<Inventory> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }
}
