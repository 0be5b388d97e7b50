//! Reassembly of delivery frames from arbitrary read chunks.
//!
//! Header sizes differ per frame kind, so nothing is consumed until a whole
//! frame (header and payload) is buffered. Each call re-peeks the header at
//! the front of the buffer. A read interrupted by the acknowledgment timeout
//! therefore never loses bytes: they wait for the next [`FrameBuffer::push`].

use bytes::BytesMut;

use super::wire_format::Header;
use super::Frame;
use crate::error::Result;

/// Accumulates inbound bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(4 * 1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(capacity),
        }
    }

    /// Append `data` and split off every frame that is now complete.
    ///
    /// # Errors
    ///
    /// An unknown discriminator or a negative length. The stream is out of
    /// sync at that point and must be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(data);

        let mut complete = Vec::new();
        while let Some(header) = Header::decode(&self.pending)? {
            let header_size = header.size();
            let frame_size = header_size + header.payload_length as usize;
            if self.pending.len() < frame_size {
                break;
            }

            let mut raw = self.pending.split_to(frame_size);
            let payload = raw.split_off(header_size).freeze();
            complete.push(Frame::new(header, payload));
        }

        Ok(complete)
    }

    /// Bytes buffered towards the next frame.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop partial data, e.g. before reading from a new stream.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
