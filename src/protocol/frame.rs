//! Delivery frames with typed constructors.
//!
//! # Example
//!
//! ```
//! use sessionwire::protocol::{Frame, FrameKind};
//! use bytes::Bytes;
//!
//! let frame = Frame::data(7, Bytes::from_static(b"hello"));
//! assert_eq!(frame.kind(), FrameKind::Data);
//! assert_eq!(&frame.encode().unwrap()[..], &[1, 7, 0, 5, 0, b'h', b'e', b'l', b'l', b'o']);
//! ```

use bytes::Bytes;

use super::wire_format::{FrameKind, Header, MAX_PAYLOAD_SIZE};
use crate::codec::BinaryWriter;
use crate::error::{Result, SessionwireError};

/// A complete delivery frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (empty for ACK).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a header and payload.
    ///
    /// The header's payload length is not checked against `payload`;
    /// [`Frame::encode`] always writes the real length.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn data(id: u16, payload: Bytes) -> Self {
        Self::with_payload(FrameKind::Data, id, 0, payload)
    }

    pub fn ack(id: u16) -> Self {
        Self::new(Header::new(FrameKind::Ack, id, 0, 0), Bytes::new())
    }

    pub fn request(id: u16, payload: Bytes) -> Self {
        Self::with_payload(FrameKind::Request, id, 0, payload)
    }

    pub fn response(id: u16, request_id: u16, payload: Bytes) -> Self {
        Self::with_payload(FrameKind::Response, id, request_id, payload)
    }

    fn with_payload(kind: FrameKind, id: u16, request_id: u16, payload: Bytes) -> Self {
        let length = payload.len().min(u16::MAX as usize) as u16;
        Self::new(Header::new(kind, id, request_id, length), payload)
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.header.id
    }

    #[inline]
    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize the frame into one contiguous buffer.
    ///
    /// # Errors
    ///
    /// [`SessionwireError::PayloadTooLarge`] if the payload does not fit the
    /// length field.
    pub fn encode(&self) -> Result<Bytes> {
        check_payload_size(self.payload.len())?;

        let mut header = self.header;
        header.payload_length = self.payload.len() as u16;

        let mut writer = BinaryWriter::with_capacity(header.size() + self.payload.len());
        header.encode_into(&mut writer);
        if self.kind().carries_payload() {
            writer.write_bytes(&self.payload);
        }
        Ok(writer.into_bytes())
    }
}

/// Reject payloads the wire format cannot describe.
pub fn check_payload_size(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(SessionwireError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}
