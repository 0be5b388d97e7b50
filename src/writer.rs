//! Per-stream writer task.
//!
//! Senders, responders and the read loop (for ACKs) all hand encoded frames
//! to the same channel. One task owns the write half and drains it, so frames
//! never interleave on the wire.
//!
//! ```text
//! send_message ─┐
//! respond      ─┼─► WriterHandle ─► writer task ─► FaultStream write half
//! read loop ACK ─┘
//! ```
//!
//! Every queued frame holds a slot from a semaphore sized by
//! `max_pending_frames`; the slot is returned once the frame is on the wire.
//! Frames that are ready together go out in one vectored write and one flush.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::duration_millis;
use crate::error::{Result, SessionwireError};
use crate::protocol::Frame;

pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on frames coalesced into one write.
const BATCH_LIMIT: usize = 64;

/// One complete encoded frame.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn from_encoded(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn encode(frame: &Frame) -> Result<Self> {
        frame.encode().map(Self::from_encoded)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Writer queue limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Frames that may be queued but unwritten before senders have to wait.
    pub max_pending_frames: usize,
    /// Capacity of the channel feeding the task.
    pub channel_capacity: usize,
    /// How long a sender waits for a free slot.
    #[serde(with = "duration_millis")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// A frame waiting in the channel together with its queue slot.
struct Queued {
    frame: OutboundFrame,
    _slot: OwnedSemaphorePermit,
}

/// Cloneable sending side of a writer task.
///
/// When every clone is gone the task writes out what it holds and exits.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Queued>,
    slots: Arc<Semaphore>,
    wait_limit: Duration,
}

impl WriterHandle {
    /// Queue `frame`, waiting up to the backpressure timeout for a slot.
    ///
    /// # Errors
    ///
    /// [`SessionwireError::BackpressureTimeout`] when no slot frees up in
    /// time, [`SessionwireError::ConnectionLost`] when the task has exited.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let slot = tokio::time::timeout(self.wait_limit, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| SessionwireError::BackpressureTimeout)?
            .map_err(|_| SessionwireError::ConnectionLost)?;

        self.tx
            .send(Queued { frame, _slot: slot })
            .await
            .map_err(|_| SessionwireError::ConnectionLost)
    }
}

/// Start a writer task that owns `writer`.
///
/// The `JoinHandle` yields the first write error, or `Ok` once every
/// handle was dropped.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = config.max_pending_frames.max(1);
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

    let handle = WriterHandle {
        tx,
        slots: Arc::new(Semaphore::new(capacity)),
        wait_limit: config.backpressure_timeout,
    };

    (handle, tokio::spawn(drain(rx, writer)))
}

async fn drain<W>(mut rx: mpsc::Receiver<Queued>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Queued> = Vec::with_capacity(BATCH_LIMIT);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < BATCH_LIMIT {
            let Ok(next) = rx.try_recv() else {
                break;
            };
            batch.push(next);
        }

        let frames: Vec<&OutboundFrame> = batch.iter().map(|queued| &queued.frame).collect();
        let written = write_frames(&mut writer, &frames).await;
        drop(frames);
        // Dropping the batch hands its slots back.
        batch.clear();

        if let Err(e) = written {
            tracing::debug!("Writer task stopped: {}", e);
            return Err(e);
        }
    }

    Ok(())
}

/// Put every frame on the wire with vectored writes, then flush once.
async fn write_frames<W>(writer: &mut W, frames: &[&OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = frames.iter().map(|frame| frame.size()).sum();
    let mut done = 0;

    while done < total {
        let slices = unwritten_slices(frames, done);
        match writer.write_vectored(&slices).await? {
            0 => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
            n => done += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything past the first `written` bytes.
fn unwritten_slices<'a>(frames: &[&'a OutboundFrame], written: usize) -> Vec<IoSlice<'a>> {
    let mut start = 0;
    frames
        .iter()
        .copied()
        .filter_map(|frame| {
            let end = start + frame.size();
            let skip = written.saturating_sub(start);
            start = end;
            (skip < frame.size()).then(|| IoSlice::new(&frame.as_bytes()[skip..]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn data(id: u16, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::encode(&Frame::data(id, Bytes::from_static(payload))).unwrap()
    }

    #[test]
    fn test_outbound_sizes() {
        assert_eq!(data(1, b"hello").size(), 5 + 5);
        assert_eq!(OutboundFrame::encode(&Frame::ack(1)).unwrap().size(), 3);
    }

    #[test]
    fn test_config_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, 1024);
        assert_eq!(config.channel_capacity, 1024);
        assert_eq!(config.backpressure_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_frame_reaches_stream() {
        let (local, mut remote) = duplex(4096);
        let (handle, _task) = spawn_writer_task(local, &WriterConfig::default());

        handle.send(data(42, b"hello")).await.unwrap();

        let mut buf = [0u8; 10];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[1, 42, 0, 5, 0, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn test_frames_keep_order() {
        let (local, mut remote) = duplex(4096);
        let (handle, _task) = spawn_writer_task(local, &WriterConfig::default());

        for i in 1..=10u16 {
            handle.send(data(i, b"abcd")).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * 9];
        remote.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(9).enumerate() {
            assert_eq!(chunk[0], 1);
            assert_eq!(u16::from_le_bytes([chunk[1], chunk[2]]), i as u16 + 1);
        }
    }

    #[tokio::test]
    async fn test_full_queue_times_out() {
        // Nobody reads the remote end, so the single slot never frees up.
        let (local, _remote) = duplex(4);
        let config = WriterConfig {
            max_pending_frames: 1,
            backpressure_timeout: Duration::from_millis(50),
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(local, &config);

        handle.send(data(1, b"more than four bytes")).await.unwrap();

        assert!(matches!(
            handle.send(data(2, b"x")).await,
            Err(SessionwireError::BackpressureTimeout)
        ));
    }

    #[test]
    fn test_unwritten_slices_after_partial_write() {
        let hello = data(1, b"hello");
        let abc = data(2, b"abc");
        let frames = [&hello, &abc];

        assert_eq!(unwritten_slices(&frames, 0).len(), 2);

        let slices = unwritten_slices(&frames, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 6);

        let slices = unwritten_slices(&frames, 10);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 8);
    }

    #[tokio::test]
    async fn test_write_frames_into_buffer() {
        let mut sink = Cursor::new(Vec::new());
        let owned: Vec<_> = (1..=5).map(|i| data(i, b"abc")).collect();
        let frames: Vec<&OutboundFrame> = owned.iter().collect();

        write_frames(&mut sink, &frames).await.unwrap();

        assert_eq!(sink.into_inner().len(), 5 * 8);
    }

    #[tokio::test]
    async fn test_task_ends_when_handles_dropped() {
        let (local, _remote) = duplex(4096);
        let (handle, task) = spawn_writer_task(local, &WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dead_stream_stops_task() {
        let (local, remote) = duplex(64);
        let stream = crate::transport::FaultStream::new(local);
        stream.switch_to_error_state();
        drop(remote);

        let (handle, task) = spawn_writer_task(stream, &WriterConfig::default());
        handle.send(data(1, b"x")).await.unwrap();

        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            handle.send(data(2, b"y")).await,
            Err(SessionwireError::ConnectionLost)
        ));
    }
}
