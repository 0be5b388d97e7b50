//! Fault-classifying stream wrapper.
//!
//! Every read or write failure is turned into exactly one [`StreamFault`]:
//!
//! - a zero-byte read means the peer closed: [`StreamFault::ClosedRemotely`]
//! - any operation after [`FaultSwitch::close_locally`]: [`StreamFault::ClosedLocally`]
//! - any operation after [`FaultSwitch::switch_to_error_state`], or any other
//!   I/O error: [`StreamFault::TransportLost`]
//!
//! The switch is shared by both halves after `tokio::io::split`, so a write
//! racing a failed read observes the same outcome.
//!
//! # Example
//!
//! ```
//! use sessionwire::transport::FaultStream;
//! use sessionwire::StreamFault;
//!
//! let (client, _server) = tokio::io::duplex(64);
//! let stream = FaultStream::new(client);
//! let switch = stream.switch();
//! switch.switch_to_error_state();
//! assert_eq!(switch.fault(), Some(StreamFault::TransportLost));
//! ```

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::StreamFault;

const OPEN: u8 = 0;
const CLOSED_LOCALLY: u8 = 1;
const ERRORED: u8 = 2;

/// Shared control over a [`FaultStream`]'s state.
///
/// Cheap to clone; all clones flip the same stream.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    state: Arc<AtomicU8>,
}

impl FaultSwitch {
    /// Create a switch in the open state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every further operation to fail with `TransportLost`.
    ///
    /// Has no effect once the stream is already faulted.
    pub fn switch_to_error_state(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, ERRORED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Mark the stream as abandoned by its owner.
    ///
    /// Further operations fail with `ClosedLocally`.
    pub fn close_locally(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, CLOSED_LOCALLY, Ordering::AcqRel, Ordering::Acquire);
    }

    /// The fault every operation currently fails with, if any.
    pub fn fault(&self) -> Option<StreamFault> {
        match self.state.load(Ordering::Acquire) {
            OPEN => None,
            CLOSED_LOCALLY => Some(StreamFault::ClosedLocally),
            _ => Some(StreamFault::TransportLost),
        }
    }

    /// Check if the stream is still usable.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.fault().is_none()
    }

    fn classify_io(&self, err: io::Error) -> io::Error {
        // A stream abandoned under a pending operation reports the abandonment.
        if let Some(fault) = self.fault() {
            return fault.into_io();
        }
        match err.get_ref().and_then(|e| e.downcast_ref::<StreamFault>()) {
            Some(_) => err,
            None => StreamFault::TransportLost.into_io(),
        }
    }
}

/// Stream wrapper that classifies every failure into a [`StreamFault`].
#[derive(Debug)]
pub struct FaultStream<S> {
    inner: S,
    switch: FaultSwitch,
}

impl<S> FaultStream<S> {
    /// Wrap a raw stream with a fresh switch.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            switch: FaultSwitch::new(),
        }
    }

    /// Wrap a raw stream controlled by an existing switch.
    pub fn with_switch(inner: S, switch: FaultSwitch) -> Self {
        Self { inner, switch }
    }

    /// Get a handle to this stream's switch.
    pub fn switch(&self) -> FaultSwitch {
        self.switch.clone()
    }

    /// See [`FaultSwitch::switch_to_error_state`].
    pub fn switch_to_error_state(&self) {
        self.switch.switch_to_error_state();
    }

    /// Get a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the raw stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FaultStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(fault) = this.switch.fault() {
            return Poll::Ready(Err(fault.into_io()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                Poll::Ready(Err(StreamFault::ClosedRemotely.into_io()))
            }
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.switch.classify_io(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FaultStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(fault) = this.switch.fault() {
            return Poll::Ready(Err(fault.into_io()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.switch.classify_io(e))),
            other => other,
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(fault) = this.switch.fault() {
            return Poll::Ready(Err(fault.into_io()));
        }
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.switch.classify_io(e))),
            other => other,
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(fault) = this.switch.fault() {
            return Poll::Ready(Err(fault.into_io()));
        }
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.switch.classify_io(e))),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Shutting down a stream that is already dead is not an error.
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Err(_)) if this.switch.fault().is_some() => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(this.switch.classify_io(e))),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_read_passes_data_through() {
        let (client, mut server) = duplex(64);
        let mut stream = FaultStream::new(client);

        server.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_zero_byte_read_is_remote_close() {
        let (client, server) = duplex(64);
        let mut stream = FaultStream::new(client);
        drop(server);

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::ClosedRemotely);
    }

    #[tokio::test]
    async fn test_empty_buffer_read_is_not_a_close() {
        let (client, _server) = duplex(64);
        let mut stream = FaultStream::new(client);

        let mut buf = [0u8; 0];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_state_fails_every_operation() {
        let (client, _server) = duplex(64);
        let mut stream = FaultStream::new(client);
        stream.switch_to_error_state();

        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::TransportLost);

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::TransportLost);

        let err = stream.flush().await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::TransportLost);
    }

    #[tokio::test]
    async fn test_split_halves_share_switch() {
        let (client, _server) = duplex(64);
        let stream = FaultStream::new(client);
        let switch = stream.switch();
        let (mut reader, mut writer) = tokio::io::split(stream);

        switch.close_locally();

        let err = writer.write_all(b"x").await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::ClosedLocally);

        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(StreamFault::classify(&err), StreamFault::ClosedLocally);
    }

    #[test]
    fn test_first_fault_wins() {
        let switch = FaultSwitch::new();
        assert!(switch.is_open());

        switch.close_locally();
        switch.switch_to_error_state();

        assert_eq!(switch.fault(), Some(StreamFault::ClosedLocally));
    }
}
