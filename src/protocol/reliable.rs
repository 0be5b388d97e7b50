//! Reliable delivery over a reconnectable stream.
//!
//! A [`ReliableProtocol`] outlives the streams attached to it. Every message
//! sent through it is kept as a [`PendingMessage`] until the peer acknowledges
//! its id. When a new stream is attached, all pending messages are written
//! again in their original order with their original ids, which gives
//! at-least-once delivery across reconnects.
//!
//! # Liveness
//!
//! The read loop waits for inbound bytes for at most the acknowledgment
//! timeout. Whenever that wait expires, and after every processed frame, it
//! checks the age of the oldest pending message. A message older than the
//! timeout means the link is dead: the stream is torn down and the protocol
//! moves to [`ProtocolState::WaitingForConnection`]. There is no in-place
//! retransmission; recovery is the controller's job (reattach).
//!
//! # Requests
//!
//! A REQUEST frame is delivered like data but its id is remembered by the
//! sender. The peer answers with a RESPONSE frame naming that id. Callers
//! awaiting a response get [`SessionwireError::RequestAborted`] as soon as the
//! protocol leaves the connected state.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

use super::frame::check_payload_size;
use super::wire_format::DEFAULT_MESSAGE_ID;
use super::{Frame, FrameBuffer, FrameKind};
use crate::error::{Result, SessionwireError, StreamFault};
use crate::transport::{FaultStream, FaultSwitch};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Default acknowledgment timeout.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of assignable message ids (everything except the sentinel).
const ID_SPACE: usize = u16::MAX as usize;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Connection state of a [`ReliableProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// A stream is attached and the read loop is running.
    Connected,
    /// No usable stream. Sends are recorded and go out on the next attach.
    WaitingForConnection,
}

/// Why the protocol left [`ProtocolState::Connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCause {
    ClosedLocally,
    ClosedRemotely,
    TransportLost,
    /// A pending message outlived the acknowledgment timeout.
    AckTimeout,
    /// The peer sent bytes that are not a valid frame.
    ProtocolViolation,
}

impl DisconnectCause {
    /// Map a failure from the stream or writer onto a cause.
    pub fn from_error(err: &SessionwireError) -> Self {
        match err {
            SessionwireError::Io(io) => StreamFault::classify(io).into(),
            SessionwireError::ConnectionClosedLocally => DisconnectCause::ClosedLocally,
            SessionwireError::ConnectionClosedRemotely => DisconnectCause::ClosedRemotely,
            SessionwireError::AckTimeout => DisconnectCause::AckTimeout,
            SessionwireError::Protocol(_) => DisconnectCause::ProtocolViolation,
            _ => DisconnectCause::TransportLost,
        }
    }

    /// Error equivalent, for reporting to the host.
    pub fn to_error(self) -> SessionwireError {
        match self {
            DisconnectCause::ClosedLocally => SessionwireError::ConnectionClosedLocally,
            DisconnectCause::ClosedRemotely => SessionwireError::ConnectionClosedRemotely,
            DisconnectCause::TransportLost => SessionwireError::ConnectionLost,
            DisconnectCause::AckTimeout => SessionwireError::AckTimeout,
            DisconnectCause::ProtocolViolation => {
                SessionwireError::Protocol("invalid frame received".to_string())
            }
        }
    }
}

impl From<StreamFault> for DisconnectCause {
    fn from(fault: StreamFault) -> Self {
        match fault {
            StreamFault::ClosedLocally => DisconnectCause::ClosedLocally,
            StreamFault::ClosedRemotely => DisconnectCause::ClosedRemotely,
            StreamFault::TransportLost => DisconnectCause::TransportLost,
        }
    }
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectCause::ClosedLocally => "closed locally",
            DisconnectCause::ClosedRemotely => "closed remotely",
            DisconnectCause::TransportLost => "transport lost",
            DisconnectCause::AckTimeout => "acknowledgment timeout",
            DisconnectCause::ProtocolViolation => "protocol violation",
        };
        f.write_str(text)
    }
}

/// Callbacks from the protocol to its owner.
///
/// Called from the read loop; implementations must not block.
pub trait ProtocolContact: Send + Sync + 'static {
    /// A DATA frame arrived (already acknowledged).
    fn received_message(&self, payload: Bytes);

    /// A REQUEST frame arrived (already acknowledged). Answer with
    /// [`ReliableProtocol::respond`] using `request_id`.
    fn received_request(&self, request_id: u16, payload: Bytes);

    /// The protocol changed state. `cause` is set when leaving `Connected`.
    ///
    /// Called while the protocol's internal lock is held, so transitions are
    /// reported in order.
    fn protocol_state_changed(&self, state: ProtocolState, cause: Option<DisconnectCause>);
}

/// Settings for one protocol instance.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub ack_timeout: Duration,
    pub writer: WriterConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            writer: WriterConfig::default(),
        }
    }
}

/// A sent but unacknowledged message.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// The frame exactly as it goes on the wire (DATA, REQUEST or RESPONSE).
    pub frame: Frame,
    /// When the frame was last written.
    pub sent_at: Instant,
}

impl PendingMessage {
    #[inline]
    pub fn id(&self) -> u16 {
        self.frame.id()
    }
}

type Responder = oneshot::Sender<Result<Bytes>>;

/// The currently attached stream.
struct Link {
    generation: u64,
    switch: FaultSwitch,
    writer: WriterHandle,
    writer_task: AbortHandle,
    reader_task: JoinHandle<()>,
}

impl Link {
    /// Fail the stream and stop its tasks.
    fn teardown(self, cause: DisconnectCause, abort_reader: bool) {
        match cause {
            DisconnectCause::ClosedLocally => self.switch.close_locally(),
            _ => self.switch.switch_to_error_state(),
        }
        self.writer_task.abort();
        if abort_reader {
            self.reader_task.abort();
        }
    }
}

/// What it takes to stop a link without the shared lock.
struct LinkAbort {
    switch: FaultSwitch,
    reader_task: AbortHandle,
    writer_task: AbortHandle,
}

impl LinkAbort {
    fn fire(self) {
        self.switch.close_locally();
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

struct Shared {
    next_id: u16,
    pending: VecDeque<PendingMessage>,
    requests: HashMap<u16, Responder>,
    link: Option<Link>,
    generation: u64,
    last_cause: Option<DisconnectCause>,
}

impl Shared {
    fn new() -> Self {
        Self {
            next_id: DEFAULT_MESSAGE_ID,
            pending: VecDeque::new(),
            requests: HashMap::new(),
            link: None,
            generation: 0,
            last_cause: None,
        }
    }

    /// Next free id after the counter, skipping the sentinel and every id
    /// that is still pending or awaiting a response.
    fn allocate_id(&mut self) -> Result<u16> {
        if self.pending.len() >= ID_SPACE {
            return Err(SessionwireError::PendingWindowFull);
        }

        for _ in 0..ID_SPACE {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == DEFAULT_MESSAGE_ID {
                self.next_id = DEFAULT_MESSAGE_ID + 1;
            }

            let id = self.next_id;
            let taken =
                self.requests.contains_key(&id) || self.pending.iter().any(|m| m.id() == id);
            if !taken {
                return Ok(id);
            }
        }

        Err(SessionwireError::PendingWindowFull)
    }

    fn abort_requests(&mut self) {
        for (_, responder) in self.requests.drain() {
            let _ = responder.send(Err(SessionwireError::RequestAborted));
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }
}

struct Inner {
    config: ProtocolConfig,
    contact: Arc<dyn ProtocolContact>,
    shared: Mutex<Shared>,
    state: watch::Sender<ProtocolState>,
    /// Latest attached link. Used on drop when the shared lock is busy.
    last_link: std::sync::Mutex<Option<LinkAbort>>,
}

/// Reliable, acknowledged message delivery over successive streams.
pub struct ReliableProtocol {
    inner: Arc<Inner>,
}

impl ReliableProtocol {
    /// Create a protocol with no stream attached.
    pub fn new(config: ProtocolConfig, contact: Arc<dyn ProtocolContact>) -> Self {
        let (state, _) = watch::channel(ProtocolState::WaitingForConnection);
        Self {
            inner: Arc::new(Inner {
                config,
                contact,
                shared: Mutex::new(Shared::new()),
                state,
                last_link: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        *self.inner.state.borrow()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ProtocolState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProtocolState> {
        self.inner.state.subscribe()
    }

    pub fn ack_timeout(&self) -> Duration {
        self.inner.config.ack_timeout
    }

    /// Attach a freshly handshaken stream.
    ///
    /// Any previously attached stream is forced into its error state first.
    /// Then every pending message is written again, oldest first, with its
    /// original id, and the read loop starts.
    pub async fn attach<S>(&self, stream: FaultStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let switch = stream.switch();
        let (read_half, write_half) = tokio::io::split(stream);

        let mut shared = self.inner.shared.lock().await;

        if let Some(previous) = shared.link.take() {
            tracing::debug!("Detaching previous stream before attach");
            previous.teardown(DisconnectCause::TransportLost, true);
            shared.abort_requests();
        }

        shared.generation += 1;
        let generation = shared.generation;

        let (writer, writer_task) = spawn_writer_task(write_half, &self.inner.config.writer);

        let now = Instant::now();
        let resend_count = shared.pending.len();
        for message in shared.pending.iter_mut() {
            message.sent_at = now;
            let outbound = match OutboundFrame::encode(&message.frame) {
                Ok(outbound) => outbound,
                Err(e) => {
                    tracing::error!("Failed to encode pending message {}: {}", message.id(), e);
                    continue;
                }
            };
            if let Err(e) = writer.send(outbound).await {
                tracing::debug!("Resend interrupted: {}", e);
                break;
            }
        }

        tracing::info!(
            "Stream attached (generation {}), resent {} pending message(s)",
            generation,
            resend_count
        );

        // The read loop owns the writer's JoinHandle; the link keeps an abort handle.
        let writer_abort = writer_task.abort_handle();
        let reader_task = tokio::spawn(read_loop(
            self.inner.clone(),
            generation,
            read_half,
            writer.clone(),
            writer_task,
        ));

        *self
            .inner
            .last_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(LinkAbort {
            switch: switch.clone(),
            reader_task: reader_task.abort_handle(),
            writer_task: writer_abort.clone(),
        });
        shared.link = Some(Link {
            generation,
            switch,
            writer,
            writer_task: writer_abort,
            reader_task,
        });
        shared.last_cause = None;

        // Still under the lock, so a read loop failing right away cannot
        // overtake this transition.
        self.inner.set_state(ProtocolState::Connected, None);
    }

    /// Send a DATA frame. Returns the assigned message id.
    ///
    /// While waiting for a connection the message is only recorded; it goes
    /// out when the next stream is attached.
    pub async fn send(&self, payload: Bytes) -> Result<u16> {
        check_payload_size(payload.len())?;
        self.inner
            .enqueue(|id| Frame::data(id, payload), None)
            .await
    }

    /// Send a REQUEST frame and wait for the matching RESPONSE payload.
    ///
    /// # Errors
    ///
    /// [`SessionwireError::RequestAborted`] if the protocol leaves the
    /// connected state (or is reset) before the response arrives.
    pub async fn request(&self, payload: Bytes) -> Result<Bytes> {
        check_payload_size(payload.len())?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .enqueue(|id| Frame::request(id, payload), Some(tx))
            .await?;

        rx.await.unwrap_or(Err(SessionwireError::RequestAborted))
    }

    /// Answer the peer's request `request_id`. Returns the response's own id.
    pub async fn respond(&self, request_id: u16, payload: Bytes) -> Result<u16> {
        check_payload_size(payload.len())?;
        self.inner
            .enqueue(|id| Frame::response(id, request_id, payload), None)
            .await
    }

    /// Close the attached stream from this side.
    ///
    /// Moves to `WaitingForConnection` with cause `ClosedLocally`. Pending
    /// messages are kept.
    pub async fn close(&self) {
        let mut shared = self.inner.shared.lock().await;
        let Some(link) = shared.link.take() else {
            return;
        };

        link.teardown(DisconnectCause::ClosedLocally, true);
        shared.abort_requests();
        shared.last_cause = Some(DisconnectCause::ClosedLocally);

        tracing::info!("Stream closed locally");
        self.inner.set_state(
            ProtocolState::WaitingForConnection,
            Some(DisconnectCause::ClosedLocally),
        );
    }

    /// Drop all session state: pending messages, the id counter and
    /// outstanding requests. Any attached stream is closed first.
    pub async fn reset(&self) {
        self.close().await;

        let mut shared = self.inner.shared.lock().await;
        shared.pending.clear();
        shared.abort_requests();
        shared.next_id = DEFAULT_MESSAGE_ID;
        shared.last_cause = None;
    }

    /// Snapshot of the pending set, oldest first.
    pub async fn pending_messages(&self) -> Vec<PendingMessage> {
        self.inner.shared.lock().await.pending.iter().cloned().collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.shared.lock().await.pending.len()
    }

    /// Why the last stream went away, if it did.
    pub async fn last_cause(&self) -> Option<DisconnectCause> {
        self.inner.shared.lock().await.last_cause
    }
}

impl Drop for ReliableProtocol {
    fn drop(&mut self) {
        let last_link = self
            .inner
            .last_link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match self.inner.shared.try_lock() {
            Ok(mut shared) => {
                if let Some(link) = shared.link.take() {
                    link.teardown(DisconnectCause::ClosedLocally, true);
                }
                shared.abort_requests();
            }
            // The read loop holds the lock; stop its tasks directly. Waiting
            // requests fail once the tasks release the shared state.
            Err(_) => {
                tracing::debug!("Protocol dropped while busy, aborting stream tasks");
                if let Some(link) = last_link {
                    link.fire();
                }
            }
        }
    }
}

impl fmt::Debug for ReliableProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableProtocol")
            .field("state", &self.state())
            .field("ack_timeout", &self.inner.config.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_state(&self, state: ProtocolState, cause: Option<DisconnectCause>) {
        self.state.send_replace(state);
        self.contact.protocol_state_changed(state, cause);
    }

    async fn enqueue<F>(&self, build: F, responder: Option<Responder>) -> Result<u16>
    where
        F: FnOnce(u16) -> Frame,
    {
        let mut shared = self.shared.lock().await;

        let id = shared.allocate_id()?;
        let frame = build(id);
        let outbound = OutboundFrame::encode(&frame)?;

        if let Some(responder) = responder {
            shared.requests.insert(id, responder);
        }
        shared.pending.push_back(PendingMessage {
            frame,
            sent_at: Instant::now(),
        });

        if let Some(link) = &shared.link {
            if let Err(e) = link.writer.send(outbound).await {
                tracing::debug!("Message {} stays pending: {}", id, e);
            }
        } else {
            tracing::debug!("Not connected, message {} recorded for resend", id);
        }

        Ok(id)
    }

    /// True if some pending message has waited longer than the timeout.
    async fn ack_overdue(&self, generation: u64) -> bool {
        let shared = self.shared.lock().await;
        if !shared.is_current(generation) {
            return false;
        }

        let timeout = self.config.ack_timeout;
        match shared.pending.iter().find(|m| m.sent_at.elapsed() > timeout) {
            Some(message) => {
                tracing::warn!(
                    "Message {} not acknowledged within {:?}",
                    message.id(),
                    timeout
                );
                true
            }
            None => false,
        }
    }

    async fn handle_frame(&self, frame: Frame, writer: &WriterHandle) -> Result<()> {
        let kind = frame.kind();
        if kind.carries_payload() {
            writer.send(OutboundFrame::encode(&Frame::ack(frame.id()))?).await?;
        }

        match kind {
            FrameKind::Ack => {
                let mut shared = self.shared.lock().await;
                if let Some(position) = shared.pending.iter().position(|m| m.id() == frame.id()) {
                    shared.pending.remove(position);
                }
            }
            FrameKind::Data => self.contact.received_message(frame.payload),
            FrameKind::Request => self.contact.received_request(frame.id(), frame.payload),
            FrameKind::Response => {
                let responder = self.shared.lock().await.requests.remove(&frame.request_id());
                match responder {
                    Some(responder) => {
                        let _ = responder.send(Ok(frame.payload));
                    }
                    None => tracing::debug!(
                        "Discarding response to unknown request {}",
                        frame.request_id()
                    ),
                }
            }
        }

        Ok(())
    }

    /// Tear down the stream of `generation` if it is still the current one.
    async fn connection_failed(&self, generation: u64, cause: DisconnectCause) {
        let mut shared = self.shared.lock().await;
        if !shared.is_current(generation) {
            return;
        }

        if let Some(link) = shared.link.take() {
            link.teardown(cause, false);
        }
        shared.abort_requests();
        shared.last_cause = Some(cause);

        tracing::warn!(
            "Connection lost ({}), {} message(s) pending",
            cause,
            shared.pending.len()
        );
        self.set_state(ProtocolState::WaitingForConnection, Some(cause));
    }
}

enum Step {
    Read(std::io::Result<usize>),
    Idle,
    WriterStopped(Option<SessionwireError>),
}

async fn read_loop<R>(
    inner: Arc<Inner>,
    generation: u64,
    mut reader: R,
    writer: WriterHandle,
    mut writer_task: JoinHandle<Result<()>>,
) where
    R: AsyncRead + Unpin,
{
    let ack_timeout = inner.config.ack_timeout;
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let cause = 'read: loop {
        let step = tokio::select! {
            joined = &mut writer_task => match joined {
                Ok(Ok(())) => Step::WriterStopped(None),
                Ok(Err(e)) => Step::WriterStopped(Some(e)),
                Err(_) => Step::WriterStopped(None),
            },
            read = tokio::time::timeout(ack_timeout, reader.read(&mut chunk)) => match read {
                Ok(result) => Step::Read(result),
                Err(_) => Step::Idle,
            },
        };

        match step {
            Step::Idle => {
                if inner.ack_overdue(generation).await {
                    break 'read DisconnectCause::AckTimeout;
                }
            }
            Step::WriterStopped(error) => {
                break 'read error
                    .as_ref()
                    .map(DisconnectCause::from_error)
                    .unwrap_or(DisconnectCause::TransportLost);
            }
            Step::Read(Err(e)) => break 'read DisconnectCause::from(StreamFault::classify(&e)),
            Step::Read(Ok(0)) => break 'read DisconnectCause::ClosedRemotely,
            Step::Read(Ok(n)) => {
                let frames = match buffer.push(&chunk[..n]) {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::error!("Invalid inbound frame: {}", e);
                        break 'read DisconnectCause::ProtocolViolation;
                    }
                };

                for frame in frames {
                    if let Err(e) = inner.handle_frame(frame, &writer).await {
                        break 'read DisconnectCause::from_error(&e);
                    }
                }

                if inner.ack_overdue(generation).await {
                    break 'read DisconnectCause::AckTimeout;
                }
            }
        }
    };

    writer_task.abort();
    inner.connection_failed(generation, cause).await;
}
