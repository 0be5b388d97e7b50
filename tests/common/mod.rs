//! Scripted server side for integration tests.
//!
//! The test server accepts TCP connections, runs the accepting side of the
//! handshake and then lets the test read and write raw frames.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sessionwire::codec::{MessageCodec, TypeRegistry};
use sessionwire::protocol::{Frame, FrameBuffer, FrameKind, Handshake};
use sessionwire::{Client, EnvelopeFormat, Message, SessionEvent, SessionId};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chat {
    pub text: String,
}

impl Message for Chat {
    const TYPE_NAME: &'static str = "Lobby.Chat";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PriceQuery {
    pub item: String,
}

impl Message for PriceQuery {
    const TYPE_NAME: &'static str = "Shop.PriceQuery";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub item: String,
    pub gold: i32,
}

impl Message for PriceQuote {
    const TYPE_NAME: &'static str = "Shop.PriceQuote";
}

/// Only the server knows this type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerNotice {
    pub code: i32,
}

impl Message for ServerNotice {
    const TYPE_NAME: &'static str = "Server.Notice";
}

pub fn server_codec() -> MessageCodec {
    let registry = Arc::new(TypeRegistry::new());
    registry.register::<Chat>();
    registry.register::<PriceQuery>();
    registry.register::<PriceQuote>();
    registry.register::<ServerNotice>();
    MessageCodec::new(EnvelopeFormat::Json, registry)
}

pub struct TestServer {
    listener: TcpListener,
    handshake: Handshake,
}

impl TestServer {
    pub async fn bind() -> Self {
        Self::bind_port(0).await
    }

    /// Listen on a specific port, e.g. one a previous server gave up.
    pub async fn bind_port(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self {
            listener,
            handshake: Handshake::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Accept a raw connection without running the handshake.
    pub async fn accept_raw(&self) -> TcpStream {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("no connection")
            .unwrap();
        stream
    }

    /// Accept a connection and complete the handshake.
    pub async fn accept(&self) -> ServerPeer {
        let mut stream = self.accept_raw().await;
        let session_id = self
            .handshake
            .welcome_from_receiver(&mut stream)
            .await
            .unwrap();
        ServerPeer {
            stream,
            buffer: FrameBuffer::new(),
            queued: VecDeque::new(),
            session_id,
            next_id: 0,
            codec: server_codec(),
        }
    }
}

pub struct ServerPeer {
    stream: TcpStream,
    buffer: FrameBuffer,
    queued: VecDeque<Frame>,
    pub session_id: SessionId,
    next_id: u16,
    pub codec: MessageCodec,
}

impl ServerPeer {
    /// Next frame from the client, or `None` once it closed the connection.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }

            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("no frame from client")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.queued.extend(self.buffer.push(&chunk[..n]).unwrap());
        }
    }

    /// Next frame that is not an ACK.
    pub async fn next_payload_frame(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await.expect("client closed");
            if frame.kind() != FrameKind::Ack {
                return frame;
            }
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        let bytes = frame.encode().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    fn allocate_id(&mut self) -> u16 {
        self.next_id += 1;
        self.next_id
    }

    pub async fn ack(&mut self, id: u16) {
        self.send_frame(&Frame::ack(id)).await;
    }

    pub async fn send_data<T: Message>(&mut self, value: &T) -> u16 {
        let id = self.allocate_id();
        let payload = Bytes::from(self.codec.encode(value).unwrap());
        self.send_frame(&Frame::data(id, payload)).await;
        id
    }

    pub async fn send_request<T: Message>(&mut self, value: &T) -> u16 {
        let id = self.allocate_id();
        let payload = Bytes::from(self.codec.encode(value).unwrap());
        self.send_frame(&Frame::request(id, payload)).await;
        id
    }

    pub async fn send_response<T: Message>(&mut self, request_id: u16, value: &T) -> u16 {
        let id = self.allocate_id();
        let payload = Bytes::from(self.codec.encode(value).unwrap());
        self.send_frame(&Frame::response(id, request_id, payload))
            .await;
        id
    }

    pub fn decode<T: Message>(&self, frame: &Frame) -> T {
        self.codec
            .decode(frame.payload())
            .unwrap()
            .downcast::<T>()
            .unwrap_or_else(|other| panic!("unexpected type {}", other.type_name()))
    }
}

/// Next session event, failing the test if none arrives in time.
pub async fn next_event(client: &mut Client) -> SessionEvent {
    tokio::time::timeout(WAIT, client.next_event())
        .await
        .expect("no session event")
        .expect("event channel closed")
}

/// Wait until every sent message has been acknowledged.
pub async fn wait_until_acked(client: &Client) {
    for _ in 0..250 {
        if client.pending_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("messages still pending");
}
