//! Codec module - binary primitives and payload serialization.
//!
//! - [`BinaryWriter`] / [`BinaryReader`] - little-endian primitives for the
//!   handshake and delivery frames
//! - [`JsonCodec`] - JSON using `serde_json` (default envelope format)
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (named fields)
//! - [`MessageCodec`] - envelopes keyed by a type hash, decoded against a
//!   [`TypeRegistry`]
//!
//! # Design
//!
//! The serializers are marker structs with static methods. Only the envelope
//! layer carries state (its format and registry).

mod binary;
mod envelope;
mod json;
mod msgpack;

pub use binary::{BinaryReader, BinaryWriter};
pub use envelope::{
    type_hash, DecodedMessage, EnvelopeFormat, Message, MessageCodec, TypeRegistry,
};
pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
