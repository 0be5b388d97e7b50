//! Reliable delivery wire format.
//!
//! Every frame starts with a one-byte discriminator. All multi-byte integers
//! are little-endian.
//!
//! ```text
//! DATA      [1][id: u16][len: i16][payload]
//! ACK       [2][id: u16]
//! REQUEST   [3][id: u16][len: i16][payload]
//! RESPONSE  [4][id: u16][request_id: u16][len: i16][payload]
//! ```
//!
//! `id` is the sender's message id, acknowledged by an ACK carrying the same
//! value. A RESPONSE is a reliable message of its own; `request_id` names the
//! REQUEST it answers.

use crate::codec::BinaryWriter;
use crate::error::{Result, SessionwireError};

/// Discriminator values.
pub mod message_type {
    pub const DATA: u8 = 1;
    pub const ACK: u8 = 2;
    pub const REQUEST: u8 = 3;
    pub const RESPONSE: u8 = 4;
}

/// Sentinel id that is never assigned to a message.
pub const DEFAULT_MESSAGE_ID: u16 = 0;

/// Largest payload the signed 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = i16::MAX as usize;

/// Largest header of any frame kind.
pub const MAX_HEADER_SIZE: usize = 7;

/// Frame kind, decoded from the discriminator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Ack,
    Request,
    Response,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            message_type::DATA => Some(FrameKind::Data),
            message_type::ACK => Some(FrameKind::Ack),
            message_type::REQUEST => Some(FrameKind::Request),
            message_type::RESPONSE => Some(FrameKind::Response),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => message_type::DATA,
            FrameKind::Ack => message_type::ACK,
            FrameKind::Request => message_type::REQUEST,
            FrameKind::Response => message_type::RESPONSE,
        }
    }

    /// Header size in bytes, discriminator included.
    pub fn header_size(self) -> usize {
        match self {
            FrameKind::Ack => 3,
            FrameKind::Data | FrameKind::Request => 5,
            FrameKind::Response => 7,
        }
    }

    /// Whether frames of this kind carry a payload and must be acknowledged.
    #[inline]
    pub fn carries_payload(self) -> bool {
        !matches!(self, FrameKind::Ack)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    /// Sender's message id.
    pub id: u16,
    /// Answered request id (RESPONSE only, 0 otherwise).
    pub request_id: u16,
    /// Payload length in bytes (0 for ACK).
    pub payload_length: u16,
}

impl Header {
    pub fn new(kind: FrameKind, id: u16, request_id: u16, payload_length: u16) -> Self {
        Self {
            kind,
            id,
            request_id,
            payload_length,
        }
    }

    /// Size of this header on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.kind.header_size()
    }

    /// Append the header to `writer`.
    pub fn encode_into(&self, writer: &mut BinaryWriter) {
        writer.write_u8(self.kind.as_u8()).write_u16(self.id);
        if self.kind == FrameKind::Response {
            writer.write_u16(self.request_id);
        }
        if self.kind.carries_payload() {
            // payload_length <= MAX_PAYLOAD_SIZE, so the cast is lossless
            writer.write_i16(self.payload_length as i16);
        }
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Unknown discriminator or negative payload length.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };
        let kind = FrameKind::from_u8(tag).ok_or_else(|| {
            SessionwireError::Protocol(format!("Unknown message type {}", tag))
        })?;

        if buf.len() < kind.header_size() {
            return Ok(None);
        }

        let id = u16::from_le_bytes([buf[1], buf[2]]);
        let (request_id, length_at) = match kind {
            FrameKind::Ack => return Ok(Some(Self::new(kind, id, 0, 0))),
            FrameKind::Response => (u16::from_le_bytes([buf[3], buf[4]]), 5),
            FrameKind::Data | FrameKind::Request => (0, 3),
        };

        let length = i16::from_le_bytes([buf[length_at], buf[length_at + 1]]);
        if length < 0 {
            return Err(SessionwireError::Protocol(format!(
                "Negative payload length {} for message {}",
                length, id
            )));
        }

        Ok(Some(Self::new(kind, id, request_id, length as u16)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(header: &Header) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        header.encode_into(&mut writer);
        writer.into_bytes().to_vec()
    }

    #[test]
    fn test_data_header_layout() {
        let bytes = encode(&Header::new(FrameKind::Data, 0x0102, 0, 5));
        assert_eq!(bytes, vec![1, 0x02, 0x01, 5, 0]);
    }

    #[test]
    fn test_ack_header_layout() {
        let bytes = encode(&Header::new(FrameKind::Ack, 513, 0, 0));
        assert_eq!(bytes, vec![2, 0x01, 0x02]);
    }

    #[test]
    fn test_response_header_layout() {
        let bytes = encode(&Header::new(FrameKind::Response, 9, 4, 2));
        assert_eq!(bytes, vec![4, 9, 0, 4, 0, 2, 0]);
        assert_eq!(bytes.len(), FrameKind::Response.header_size());
    }

    #[test]
    fn test_decode_needs_full_header() {
        assert_eq!(Header::decode(&[]).unwrap(), None);
        assert_eq!(Header::decode(&[1, 0, 0]).unwrap(), None);
        assert_eq!(
            Header::decode(&[1, 7, 0, 3, 0]).unwrap(),
            Some(Header::new(FrameKind::Data, 7, 0, 3))
        );
    }

    #[test]
    fn test_decode_request_and_response() {
        assert_eq!(
            Header::decode(&[3, 1, 0, 0, 1]).unwrap(),
            Some(Header::new(FrameKind::Request, 1, 0, 256))
        );
        assert_eq!(
            Header::decode(&[4, 2, 0, 1, 0, 0, 0]).unwrap(),
            Some(Header::new(FrameKind::Response, 2, 1, 0))
        );
    }

    #[test]
    fn test_unknown_discriminator_rejected() {
        let err = Header::decode(&[9, 0, 0]).unwrap_err();
        assert!(err.to_string().contains("Unknown message type 9"));
    }

    #[test]
    fn test_negative_length_rejected() {
        assert!(Header::decode(&[1, 1, 0, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            FrameKind::Data,
            FrameKind::Ack,
            FrameKind::Request,
            FrameKind::Response,
        ] {
            assert_eq!(FrameKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(FrameKind::from_u8(0), None);
    }
}
