//! Self-describing message envelope and the type registry behind it.
//!
//! Every application payload travels as a record
//!
//! ```text
//! { "message": <i32 type hash>, "body": <structured value> }
//! ```
//!
//! where the type hash is the first four bytes (little-endian) of SHA-256
//! over the type's fully-qualified name. Decoding looks the hash up in a
//! [`TypeRegistry`]; an unknown hash is always an error, never a silent drop.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use sessionwire::codec::{EnvelopeFormat, Message, MessageCodec, TypeRegistry};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Chat { text: String }
//!
//! impl Message for Chat {
//!     const TYPE_NAME: &'static str = "Game.Messages.Chat";
//! }
//!
//! let registry = Arc::new(TypeRegistry::new());
//! registry.register::<Chat>();
//!
//! let codec = MessageCodec::new(EnvelopeFormat::Json, registry);
//! let bytes = codec.encode(&Chat { text: "hi".into() }).unwrap();
//! let decoded = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded.downcast::<Chat>().unwrap(), Chat { text: "hi".into() });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{JsonCodec, MsgPackCodec};
use crate::error::{Result, SessionwireError};

/// Application type that can travel inside an envelope.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Stable, fully-qualified name both peers agree on.
    const TYPE_NAME: &'static str;

    /// Hash of [`Self::TYPE_NAME`] carried in the envelope.
    fn type_hash() -> i32 {
        type_hash(Self::TYPE_NAME)
    }
}

/// Stable 32-bit hash of a type name.
pub fn type_hash(type_name: &str) -> i32 {
    let digest = Sha256::digest(type_name.as_bytes());
    i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Serialized form of the envelope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeFormat {
    /// UTF-8 JSON text.
    #[default]
    Json,
    /// MessagePack map with named fields.
    MsgPack,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T> {
    message: i32,
    body: &'a T,
}

/// Just the type hash; the body is skipped in the first pass.
#[derive(Deserialize)]
struct EnvelopeTag {
    message: i32,
}

#[derive(Deserialize)]
struct InboundEnvelope<T> {
    body: T,
}

type DecodeFn = fn(EnvelopeFormat, &[u8]) -> Result<Box<dyn Any + Send>>;

/// Decode the body as `T` straight from the envelope bytes, in the
/// envelope's own format.
fn decode_body<T: Message>(format: EnvelopeFormat, bytes: &[u8]) -> Result<Box<dyn Any + Send>> {
    let envelope: InboundEnvelope<T> = match format {
        EnvelopeFormat::Json => JsonCodec::decode(bytes)?,
        EnvelopeFormat::MsgPack => MsgPackCodec::decode(bytes)?,
    };
    Ok(Box::new(envelope.body))
}

#[derive(Clone, Copy)]
struct TypeEntry {
    name: &'static str,
    decode: DecodeFn,
}

/// Registry mapping type hashes to decoders.
///
/// Read-mostly: lookups take a shared lock, registration an exclusive one,
/// so types can be added while other tasks decode.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<i32, TypeEntry>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` unless its hash is already known.
    ///
    /// Returns `true` if the type was added.
    pub fn register<T: Message>(&self) -> bool {
        let hash = T::type_hash();
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = types.get(&hash) {
            if existing.name != T::TYPE_NAME {
                tracing::warn!(
                    "Type hash collision: {} and {} both hash to {}",
                    existing.name,
                    T::TYPE_NAME,
                    hash
                );
            }
            return false;
        }

        types.insert(
            hash,
            TypeEntry {
                name: T::TYPE_NAME,
                decode: decode_body::<T>,
            },
        );
        true
    }

    /// Idempotent registration, used for response types discovered late.
    #[inline]
    pub fn register_if_absent<T: Message>(&self) {
        self.register::<T>();
    }

    /// Check whether a hash is registered.
    pub fn contains(&self, hash: i32) -> bool {
        self.read().contains_key(&hash)
    }

    /// Get the registered type name for a hash.
    pub fn type_name(&self, hash: i32) -> Option<&'static str> {
        self.read().get(&hash).map(|e| e.name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn lookup(&self, hash: i32) -> Option<TypeEntry> {
        self.read().get(&hash).copied()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i32, TypeEntry>> {
        self.types.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = self.read();
        f.debug_map()
            .entries(types.iter().map(|(hash, entry)| (hash, entry.name)))
            .finish()
    }
}

/// A decoded envelope whose concrete type is known only at runtime.
pub struct DecodedMessage {
    type_hash: i32,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl DecodedMessage {
    pub fn type_hash(&self) -> i32 {
        self.type_hash
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check whether the message holds a `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value out as a `T`, or get the message back unchanged.
    pub fn downcast<T: Message>(self) -> std::result::Result<T, Self> {
        let Self {
            type_hash,
            type_name,
            value,
        } = self;

        match value.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(value) => Err(Self {
                type_hash,
                type_name,
                value,
            }),
        }
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("type_hash", &self.type_hash)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Encodes values into envelopes and decodes them against a registry.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    format: EnvelopeFormat,
    registry: Arc<TypeRegistry>,
}

impl MessageCodec {
    pub fn new(format: EnvelopeFormat, registry: Arc<TypeRegistry>) -> Self {
        Self { format, registry }
    }

    pub fn format(&self) -> EnvelopeFormat {
        self.format
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Wrap `value` in an envelope and serialize it.
    pub fn encode<T: Message>(&self, value: &T) -> Result<Vec<u8>> {
        let envelope = OutboundEnvelope {
            message: T::type_hash(),
            body: value,
        };

        match self.format {
            EnvelopeFormat::Json => JsonCodec::encode(&envelope),
            EnvelopeFormat::MsgPack => MsgPackCodec::encode(&envelope),
        }
    }

    /// Parse an envelope and decode its body with the registered decoder.
    ///
    /// # Errors
    ///
    /// [`SessionwireError::UnregisteredType`] if the hash is unknown.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage> {
        let tag: EnvelopeTag = match self.format {
            EnvelopeFormat::Json => JsonCodec::decode(bytes)?,
            EnvelopeFormat::MsgPack => MsgPackCodec::decode(bytes)?,
        };

        let entry = self
            .registry
            .lookup(tag.message)
            .ok_or(SessionwireError::UnregisteredType(tag.message))?;

        Ok(DecodedMessage {
            type_hash: tag.message,
            type_name: entry.name,
            value: (entry.decode)(self.format, bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct PlayerMoved {
        player: u32,
        x: f32,
        y: f32,
    }

    impl Message for PlayerMoved {
        const TYPE_NAME: &'static str = "Game.Messages.PlayerMoved";
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        seq: u64,
    }

    impl Message for Ping {
        const TYPE_NAME: &'static str = "Game.Messages.Ping";
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Inventory {
        slots: HashMap<u32, String>,
        blob: Vec<u8>,
    }

    impl Message for Inventory {
        const TYPE_NAME: &'static str = "Game.Messages.Inventory";
    }

    fn codec(format: EnvelopeFormat) -> MessageCodec {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<PlayerMoved>();
        MessageCodec::new(format, registry)
    }

    #[test]
    fn test_type_hash_is_sha256_prefix() {
        // sha256("abc") = ba7816bf...
        assert_eq!(type_hash("abc"), i32::from_le_bytes([0xba, 0x78, 0x16, 0xbf]));
        assert_eq!(type_hash("abc"), type_hash("abc"));
        assert_ne!(PlayerMoved::type_hash(), Ping::type_hash());
    }

    #[test]
    fn test_json_envelope_shape() {
        let codec = codec(EnvelopeFormat::Json);
        let bytes = codec
            .encode(&PlayerMoved {
                player: 3,
                x: 1.5,
                y: -2.0,
            })
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["message"], PlayerMoved::type_hash());
        assert_eq!(parsed["body"]["player"], 3);
        assert_eq!(parsed["body"]["x"], 1.5);
    }

    #[test]
    fn test_decode_registered_type() {
        for format in [EnvelopeFormat::Json, EnvelopeFormat::MsgPack] {
            let codec = codec(format);
            let original = PlayerMoved {
                player: 9,
                x: 0.25,
                y: 4.0,
            };

            let decoded = codec.decode(&codec.encode(&original).unwrap()).unwrap();
            assert_eq!(decoded.type_name(), PlayerMoved::TYPE_NAME);
            assert!(decoded.is::<PlayerMoved>());
            assert_eq!(decoded.downcast::<PlayerMoved>().unwrap(), original);
        }
    }

    #[test]
    fn test_msgpack_body_with_integer_keys() {
        let codec = codec(EnvelopeFormat::MsgPack);
        codec.registry().register::<Inventory>();

        let original = Inventory {
            slots: HashMap::from([(3, "sword".to_string()), (7, "shield".to_string())]),
            blob: vec![0, 255, 17],
        };

        let decoded = codec.decode(&codec.encode(&original).unwrap()).unwrap();
        assert_eq!(decoded.downcast::<Inventory>().unwrap(), original);
    }

    #[test]
    fn test_decode_unregistered_type_fails() {
        let codec = codec(EnvelopeFormat::Json);
        let bytes = codec.encode(&Ping { seq: 1 }).unwrap();

        match codec.decode(&bytes) {
            Err(SessionwireError::UnregisteredType(hash)) => assert_eq!(hash, Ping::type_hash()),
            other => panic!("expected UnregisteredType, got {:?}", other),
        }
    }

    #[test]
    fn test_register_if_absent_is_idempotent() {
        let registry = TypeRegistry::new();
        assert!(registry.register::<Ping>());
        registry.register_if_absent::<Ping>();
        assert!(!registry.register::<Ping>());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.type_name(Ping::type_hash()), Some(Ping::TYPE_NAME));
    }

    #[test]
    fn test_late_registration_enables_decode() {
        let codec = codec(EnvelopeFormat::Json);
        let bytes = codec.encode(&Ping { seq: 5 }).unwrap();
        assert!(codec.decode(&bytes).is_err());

        codec.registry().register_if_absent::<Ping>();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { seq: 5 }));
    }

    #[test]
    fn test_downcast_wrong_type_returns_message() {
        let codec = codec(EnvelopeFormat::Json);
        let bytes = codec
            .encode(&PlayerMoved {
                player: 1,
                x: 0.0,
                y: 0.0,
            })
            .unwrap();

        let decoded = codec.decode(&bytes).unwrap();
        let back = decoded.downcast::<Ping>().unwrap_err();
        assert_eq!(back.type_hash(), PlayerMoved::type_hash());
    }

    #[test]
    fn test_malformed_body_is_error() {
        let codec = codec(EnvelopeFormat::Json);
        let bytes = format!(
            r#"{{"message":{},"body":{{"player":"not a number"}}}}"#,
            PlayerMoved::type_hash()
        );
        assert!(matches!(
            codec.decode(bytes.as_bytes()),
            Err(SessionwireError::Json(_))
        ));
    }

    #[test]
    fn test_concurrent_registration_and_lookup() {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<PlayerMoved>();

        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    registry.register_if_absent::<Ping>();
                }
            })
        };

        for _ in 0..100 {
            assert!(registry.contains(PlayerMoved::type_hash()));
        }
        writer.join().unwrap();
        assert_eq!(registry.len(), 2);
    }
}
