//! Client builder and session controller.
//!
//! The [`ClientBuilder`] collects configuration, message types and
//! handlers. The [`Client`] owns the session lifecycle:
//! 1. Open a TCP connection
//! 2. Run the handshake (new or restored session id)
//! 3. Attach the stream to the reliable delivery protocol
//! 4. Watch protocol state and reconnect or dispose when the stream dies
//!
//! Everything the session observes is reported as a [`SessionEvent`] on a
//! channel. The host drains it from its own loop and hands messages to
//! [`Client::dispatch`], so handlers always run on the host's task.
//!
//! # Example
//!
//! ```ignore
//! use sessionwire::{Client, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::builder()
//!         .server("127.0.0.1", 7777)
//!         .reconnect(true)
//!         .on(|chat: Chat| async move {
//!             println!("{}", chat.text);
//!             Ok(())
//!         })
//!         .start()
//!         .await?;
//!
//!     while let Some(event) = client.next_event().await {
//!         match event {
//!             SessionEvent::Connected { restored, .. } => println!("connected ({})", restored),
//!             SessionEvent::Disposed { .. } => break,
//!             other => {
//!                 client.dispatch(other).await?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::codec::{DecodedMessage, EnvelopeFormat, Message, MessageCodec, TypeRegistry};
use crate::config::ClientConfig;
use crate::error::{Result, SessionwireError};
use crate::handler::{HandlerRegistry, HandlerResult, IncomingRequest, RequestContext};
use crate::protocol::{
    DisconnectCause, Handshake, ProtocolContact, ProtocolState, ReliableProtocol, SessionId,
};
use crate::transport::connect_tcp;

/// Something the session wants the host to know about.
#[derive(Debug)]
pub enum SessionEvent {
    /// A stream is attached. `restored` is true when the server accepted the
    /// session id from an earlier connection.
    Connected { session_id: SessionId, restored: bool },
    /// A connection attempt failed. `retrying` tells whether another attempt
    /// follows after the reconnection delay.
    ConnectionFailed {
        error: SessionwireError,
        retrying: bool,
    },
    /// The connection was lost and the client is reconnecting.
    Disconnected { cause: DisconnectCause },
    /// The session ended. Pending messages and the session id are gone.
    /// `cause` is `None` after an explicit disconnect.
    Disposed { cause: Option<DisconnectCause> },
    /// A one-way message from the peer.
    Message(DecodedMessage),
    /// A request from the peer, waiting for an answer.
    Request(IncomingRequest),
    /// A failure that does not end the session (e.g. an unregistered type).
    Error(SessionwireError),
}

/// Builder for configuring and creating a session client.
pub struct ClientBuilder {
    config: ClientConfig,
    handshake: Handshake,
    types: Arc<TypeRegistry>,
    handlers: HandlerRegistry,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config,
            handshake: Handshake::new(),
            types: Arc::new(TypeRegistry::new()),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Set the server address.
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.server_host = host.into();
        self.config.server_port = port;
        self
    }

    /// Connect as soon as the client starts. Default: true
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Reconnect when the connection is lost instead of disposing the
    /// session. Default: false
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect = enabled;
        self
    }

    /// Keep retrying failed connection attempts. Default: false
    pub fn repeat_connection_attempts(mut self, enabled: bool) -> Self {
        self.config.repeat_connection_attempts = enabled;
        self
    }

    /// Default: 5 seconds
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Default: 5 seconds
    pub fn reconnection_delay(mut self, delay: Duration) -> Self {
        self.config.reconnection_delay = delay;
        self
    }

    pub fn envelope_format(mut self, format: EnvelopeFormat) -> Self {
        self.config.envelope_format = format;
        self
    }

    /// Set the maximum queued outbound frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Use a specific handshake (e.g. another protocol version).
    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Register a message type that can be decoded without a handler.
    pub fn message<T: Message>(self) -> Self {
        self.types.register::<T>();
        self
    }

    /// Register a message type together with its handler.
    pub fn on<T, F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: Message,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.types.register::<T>();
        self.handlers.on(handler);
        self
    }

    /// Register a request type together with the handler that answers it.
    pub fn on_request<T, F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: Message,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.types.register::<T>();
        self.handlers.on_request(handler);
        self
    }

    /// Build the client and, with auto-connect, start connecting in the
    /// background.
    pub async fn start(self) -> Result<Client> {
        Client::start(self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards protocol callbacks into the session's channels.
struct SessionContact {
    codec: MessageCodec,
    protocol: Weak<ReliableProtocol>,
    events: mpsc::UnboundedSender<SessionEvent>,
    lost: mpsc::UnboundedSender<DisconnectCause>,
}

impl SessionContact {
    fn decode(&self, payload: &[u8]) -> Option<DecodedMessage> {
        match self.codec.decode(payload) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::error!("Failed to decode inbound message: {}", e);
                let _ = self.events.send(SessionEvent::Error(e));
                None
            }
        }
    }
}

impl ProtocolContact for SessionContact {
    fn received_message(&self, payload: Bytes) {
        if let Some(message) = self.decode(&payload) {
            tracing::debug!("Message received: {}", message.type_name());
            let _ = self.events.send(SessionEvent::Message(message));
        }
    }

    fn received_request(&self, request_id: u16, payload: Bytes) {
        let Some(protocol) = self.protocol.upgrade() else {
            return;
        };
        if let Some(message) = self.decode(&payload) {
            let ctx = RequestContext::with_protocol(request_id, protocol, self.codec.clone());
            let _ = self
                .events
                .send(SessionEvent::Request(IncomingRequest::new(message, ctx)));
        }
    }

    fn protocol_state_changed(&self, state: ProtocolState, cause: Option<DisconnectCause>) {
        if state == ProtocolState::WaitingForConnection {
            let _ = self
                .lost
                .send(cause.unwrap_or(DisconnectCause::TransportLost));
        }
    }
}

/// State shared by the client, its handles and the supervisor task.
struct Session {
    config: ClientConfig,
    handshake: Handshake,
    codec: MessageCodec,
    protocol: Arc<ReliableProtocol>,
    session_id: std::sync::Mutex<Option<SessionId>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    /// Bumped by every dispose; attempts started earlier must not attach.
    epoch: watch::Sender<u64>,
    connecting: Mutex<()>,
    /// Held while attaching or disposing so the two never interleave.
    lifecycle: Mutex<()>,
}

impl Session {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn session_id(&self) -> Option<SessionId> {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_session_id(&self, id: Option<SessionId>) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the session is shut down.
    async fn cancelled(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Resolves on shutdown or once the session is disposed after `epoch`.
    async fn interrupted(&self, epoch: u64) {
        let mut epochs = self.epoch.subscribe();
        tokio::select! {
            _ = self.cancelled() => {}
            _ = epochs.wait_for(|current| *current != epoch) => {}
        }
    }

    /// Connect, retrying per configuration.
    ///
    /// Failed attempts that will be retried are reported as events; the
    /// final failure is returned. A dispose while this runs ends it with
    /// [`SessionwireError::SessionClosed`].
    async fn connect_loop(&self) -> Result<SessionId> {
        let epoch = self.epoch();
        let _guard = self.connecting.lock().await;

        loop {
            if self.is_cancelled() || self.epoch() != epoch {
                return Err(SessionwireError::SessionClosed);
            }
            if self.protocol.is_connected() {
                if let Some(id) = self.session_id() {
                    return Ok(id);
                }
            }

            let error = match self.try_connect(epoch).await {
                Ok(id) => return Ok(id),
                Err(e) => e,
            };

            let retrying = self.config.repeat_connection_attempts
                && !error.is_fatal()
                && !matches!(
                    error,
                    SessionwireError::HandshakeCanceled | SessionwireError::SessionClosed
                );
            if !retrying {
                return Err(error);
            }

            tracing::warn!(
                "Connection attempt failed: {}, retrying in {:?}",
                error,
                self.config.reconnection_delay
            );
            self.emit(SessionEvent::ConnectionFailed {
                error,
                retrying: true,
            });

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnection_delay) => {}
                _ = self.interrupted(epoch) => return Err(SessionwireError::SessionClosed),
            }
        }
    }

    async fn try_connect(&self, epoch: u64) -> Result<SessionId> {
        let host = self.config.server_host.as_str();
        let port = self.config.server_port;

        let mut stream = tokio::select! {
            result = connect_tcp(host, port) => result?,
            _ = self.interrupted(epoch) => return Err(SessionwireError::SessionClosed),
        };

        let prior = self.session_id();
        let switch = stream.switch();
        let id = tokio::select! {
            result = self.handshake.welcome_from_sender(&mut stream, prior) => result?,
            _ = self.interrupted(epoch) => {
                switch.close_locally();
                return Err(SessionwireError::HandshakeCanceled);
            }
        };

        let lifecycle = self.lifecycle.lock().await;
        if self.is_cancelled() || self.epoch() != epoch {
            tracing::debug!("Session disposed during handshake, dropping stream");
            switch.close_locally();
            return Err(SessionwireError::SessionClosed);
        }

        let restored = prior == Some(id);
        self.set_session_id(Some(id));
        self.protocol.attach(stream).await;
        drop(lifecycle);

        tracing::info!(
            "Connected to {}:{} ({} session {})",
            host,
            port,
            if restored { "restored" } else { "new" },
            id
        );
        self.emit(SessionEvent::Connected {
            session_id: id,
            restored,
        });
        Ok(id)
    }

    /// End the session: drop pending state and forget the session id.
    ///
    /// Connect attempts already in flight are abandoned.
    async fn dispose(&self, cause: Option<DisconnectCause>) {
        let _lifecycle = self.lifecycle.lock().await;
        self.epoch.send_modify(|epoch| *epoch += 1);
        self.protocol.reset().await;
        self.set_session_id(None);
        tracing::info!("Session disposed");
        self.emit(SessionEvent::Disposed { cause });
    }

    async fn connection_lost(&self, cause: DisconnectCause) {
        // Local closes come from disconnect/shutdown, which report themselves.
        if cause == DisconnectCause::ClosedLocally
            || self.is_cancelled()
            || self.protocol.is_connected()
        {
            return;
        }

        if !self.config.reconnect {
            self.dispose(Some(cause)).await;
            return;
        }

        tracing::info!("Connection lost ({}), reconnecting", cause);
        self.emit(SessionEvent::Disconnected { cause });

        // A final failure leaves the session waiting with its id and pending
        // messages, so a later connect() can still restore it.
        match self.connect_loop().await {
            Ok(_) => {}
            Err(SessionwireError::SessionClosed | SessionwireError::HandshakeCanceled) => {}
            Err(error) => {
                tracing::error!("Reconnection failed: {}", error);
                self.emit(SessionEvent::ConnectionFailed {
                    error,
                    retrying: false,
                });
            }
        }
    }
}

/// Watch for lost connections until shutdown.
async fn supervise(session: Arc<Session>, mut lost: mpsc::UnboundedReceiver<DisconnectCause>) {
    loop {
        let cause = tokio::select! {
            cause = lost.recv() => match cause {
                Some(cause) => cause,
                None => break,
            },
            _ = session.cancelled() => break,
        };

        session.connection_lost(cause).await;
    }

    tracing::debug!("Session supervisor stopped");
}

async fn connect_in_background(session: Arc<Session>) {
    match session.connect_loop().await {
        Ok(_) | Err(SessionwireError::SessionClosed | SessionwireError::HandshakeCanceled) => {}
        Err(error) => {
            tracing::error!("Connection failed: {}", error);
            session.emit(SessionEvent::ConnectionFailed {
                error,
                retrying: false,
            });
        }
    }
}

/// Cloneable handle for sending through a session from any task.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    /// Current session id, if a handshake has completed.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.session_id()
    }

    pub fn state(&self) -> ProtocolState {
        self.session.protocol.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.protocol.is_connected()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.session.codec
    }

    /// Connect now, retrying per configuration.
    ///
    /// Returns immediately if already connected.
    pub async fn connect(&self) -> Result<SessionId> {
        self.session.connect_loop().await
    }

    /// Send a one-way message. Returns its message id.
    ///
    /// While disconnected the message is kept and sent after the next
    /// successful connect.
    pub async fn send_message<T: Message>(&self, value: &T) -> Result<u16> {
        let payload = self.session.codec.encode(value)?;
        self.session.protocol.send(Bytes::from(payload)).await
    }

    /// Send a request and wait for the typed response.
    ///
    /// `Resp` is registered for decoding if it is not known yet.
    pub async fn send_request<Req, Resp>(&self, value: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        let codec = &self.session.codec;
        codec.registry().register_if_absent::<Resp>();

        let payload = codec.encode(value)?;
        let response = self.session.protocol.request(Bytes::from(payload)).await?;

        codec
            .decode(&response)?
            .downcast::<Resp>()
            .map_err(|other| SessionwireError::UnexpectedResponseType {
                expected: Resp::TYPE_NAME,
                actual: other.type_name(),
            })
    }

    /// Number of messages still waiting for acknowledgment.
    pub async fn pending_count(&self) -> usize {
        self.session.protocol.pending_count().await
    }

    /// End the session: close the connection, drop pending messages and
    /// the session id. Emits [`SessionEvent::Disposed`].
    ///
    /// A connect in progress is abandoned and returns
    /// [`SessionwireError::SessionClosed`].
    pub async fn disconnect(&self) {
        self.session.dispose(None).await;
    }

    /// Disconnect and stop all background work. Pending reconnect delays
    /// and handshakes are abandoned.
    pub async fn shutdown(&self) {
        self.session.shutdown.send_replace(true);
        self.disconnect().await;
    }
}

/// A session client.
///
/// Sends go through the methods here or through a [`SessionHandle`];
/// everything inbound arrives via [`Client::next_event`].
pub struct Client {
    handle: SessionHandle,
    handlers: Arc<HandlerRegistry>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    async fn start(builder: ClientBuilder) -> Result<Self> {
        let ClientBuilder {
            config,
            handshake,
            types,
            handlers,
        } = builder;

        let codec = MessageCodec::new(config.envelope_format, types);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        let protocol = Arc::new_cyclic(|weak| {
            let contact = SessionContact {
                codec: codec.clone(),
                protocol: weak.clone(),
                events: events_tx.clone(),
                lost: lost_tx,
            };
            ReliableProtocol::new(config.protocol_config(), Arc::new(contact))
        });

        let (shutdown, _) = watch::channel(false);
        let (epoch, _) = watch::channel(0);
        let auto_connect = config.auto_connect;

        let session = Arc::new(Session {
            config,
            handshake,
            codec,
            protocol,
            session_id: std::sync::Mutex::new(None),
            events: events_tx,
            shutdown,
            epoch,
            connecting: Mutex::new(()),
            lifecycle: Mutex::new(()),
        });

        tokio::spawn(supervise(session.clone(), lost_rx));

        if auto_connect {
            tokio::spawn(connect_in_background(session.clone()));
        }

        Ok(Client {
            handle: SessionHandle { session },
            handlers: Arc::new(handlers),
            events: events_rx,
        })
    }

    /// Get a cloneable handle for sending from other tasks.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the client is shut down and every event has
    /// been consumed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Take every event that is ready without waiting.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Run the registered handler for a message or request event.
    ///
    /// Returns `Ok(false)` if the event is not a message/request or no
    /// handler is registered for its type.
    pub async fn dispatch(&self, event: SessionEvent) -> Result<bool> {
        match event {
            SessionEvent::Message(message) => self.handlers.dispatch_message(message).await,
            SessionEvent::Request(request) => {
                let (message, ctx) = request.into_parts();
                self.handlers.dispatch_request(message, ctx).await
            }
            _ => Ok(false),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.handle.session_id()
    }

    pub fn state(&self) -> ProtocolState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub async fn connect(&self) -> Result<SessionId> {
        self.handle.connect().await
    }

    pub async fn send_message<T: Message>(&self, value: &T) -> Result<u16> {
        self.handle.send_message(value).await
    }

    pub async fn send_request<Req, Resp>(&self, value: &Req) -> Result<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        self.handle.send_request(value).await
    }

    pub async fn pending_count(&self) -> usize {
        self.handle.pending_count().await
    }

    pub async fn disconnect(&self) {
        self.handle.disconnect().await;
    }

    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.session.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Chat {
        text: String,
    }

    impl Message for Chat {
        const TYPE_NAME: &'static str = "Tests.Chat";
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Client::builder()
            .server("10.0.0.2", 9100)
            .auto_connect(false)
            .reconnect(true)
            .repeat_connection_attempts(true)
            .ack_timeout(Duration::from_millis(700))
            .reconnection_delay(Duration::from_millis(300))
            .envelope_format(EnvelopeFormat::MsgPack)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10));

        let config = &builder.config;
        assert_eq!(config.server_host, "10.0.0.2");
        assert_eq!(config.server_port, 9100);
        assert!(!config.auto_connect);
        assert!(config.reconnect);
        assert!(config.repeat_connection_attempts);
        assert_eq!(config.ack_timeout, Duration::from_millis(700));
        assert_eq!(config.reconnection_delay, Duration::from_millis(300));
        assert_eq!(config.envelope_format, EnvelopeFormat::MsgPack);
        assert_eq!(config.writer.max_pending_frames, 2048);
        assert_eq!(config.writer.channel_capacity, 512);
        assert_eq!(config.writer.backpressure_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_registers_types_and_handlers() {
        let builder = Client::builder().on(|_: Chat| async { Ok(()) });

        assert!(builder.types.contains(Chat::type_hash()));
        assert!(builder.handlers.has_handler(Chat::type_hash()));
    }

    #[tokio::test]
    async fn test_messages_recorded_while_disconnected() {
        let mut client = Client::builder()
            .auto_connect(false)
            .message::<Chat>()
            .start()
            .await
            .unwrap();

        assert_eq!(client.state(), ProtocolState::WaitingForConnection);
        assert_eq!(client.session_id(), None);

        let id = client
            .send_message(&Chat {
                text: "later".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(client.pending_count().await, 1);

        client.disconnect().await;
        assert_eq!(client.pending_count().await, 0);
        assert!(matches!(
            client.next_event().await,
            Some(SessionEvent::Disposed { cause: None })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = Client::builder()
            .server("127.0.0.1", port)
            .start()
            .await
            .unwrap();

        match client.next_event().await {
            Some(SessionEvent::ConnectionFailed { retrying, .. }) => assert!(!retrying),
            other => panic!("expected ConnectionFailed, got {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_lifecycle_events() {
        let client = Client::builder().auto_connect(false).start().await.unwrap();
        assert!(!client
            .dispatch(SessionEvent::Disposed { cause: None })
            .await
            .unwrap());
    }
}
