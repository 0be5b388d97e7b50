//! Little-endian binary primitives for the handshake and delivery frames.
//!
//! [`BinaryWriter`] accumulates a whole protocol phase in memory and writes it
//! out in one go, so concurrent writers never interleave partial messages.
//! [`BinaryReader`] pulls fixed-width values off an async stream.
//!
//! # Example
//!
//! ```
//! use sessionwire::codec::BinaryWriter;
//!
//! let mut writer = BinaryWriter::new();
//! writer.write_u8(1).write_u16(7).write_i16(3).write_bytes(b"abc");
//! assert_eq!(&writer.into_bytes()[..], &[1, 7, 0, 3, 0, b'a', b'b', b'c']);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::protocol::SessionId;

/// Buffered little-endian writer.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.put_u8(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.buffer.put_i16_le(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.put_u16_le(value);
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.put_i32_le(value);
        self
    }

    /// Write a session id in its 16-byte wire layout.
    pub fn write_session_id(&mut self, id: &SessionId) -> &mut Self {
        self.buffer.put_slice(&id.to_wire_bytes());
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buffer.put_slice(value);
        self
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the buffered bytes, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Consume the writer and return the buffered bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Write everything buffered so far to `out` and flush it.
    ///
    /// The buffer is emptied even if the write fails; a failed phase is never
    /// replayed on the same stream.
    pub async fn flush_to<W>(&mut self, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.take();
        out.write_all(&bytes).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Little-endian reader over an async stream.
#[derive(Debug)]
pub struct BinaryReader<'a, R> {
    inner: &'a mut R,
}

impl<'a, R: AsyncRead + Unpin> BinaryReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Self {
        Self { inner }
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.inner.read_u8().await?)
    }

    /// Any non-zero byte is `true`.
    pub async fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8().await? != 0)
    }

    pub async fn read_i16(&mut self) -> Result<i16> {
        Ok(self.inner.read_i16_le().await?)
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        Ok(self.inner.read_u16_le().await?)
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        Ok(self.inner.read_i32_le().await?)
    }

    pub async fn read_session_id(&mut self) -> Result<SessionId> {
        let mut raw = [0u8; SessionId::WIRE_SIZE];
        self.inner.read_exact(&mut raw).await?;
        Ok(SessionId::from_wire_bytes(raw))
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        let mut raw = vec![0u8; len];
        self.inner.read_exact(&mut raw).await?;
        Ok(Bytes::from(raw))
    }
}
