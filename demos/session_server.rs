//! Session Server - minimal peer for trying out the client.
//!
//! Accepts connections, runs the accepting side of the handshake and then:
//! - acknowledges every DATA / REQUEST / RESPONSE frame
//! - echoes `Chat` messages back with a prefix
//! - answers `PriceQuery` requests with a `PriceQuote`
//!
//! It keeps no state between connections, so a restored session simply
//! continues on a fresh connection.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example session_server
//! cargo run --example chat_client
//! ```

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sessionwire::codec::{MessageCodec, TypeRegistry};
use sessionwire::protocol::{Frame, FrameBuffer, FrameKind, Handshake};
use sessionwire::{EnvelopeFormat, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Chat {
    text: String,
}

impl Message for Chat {
    const TYPE_NAME: &'static str = "Demo.Chat";
}

#[derive(Serialize, Deserialize, Debug)]
struct PriceQuery {
    item: String,
}

impl Message for PriceQuery {
    const TYPE_NAME: &'static str = "Demo.PriceQuery";
}

#[derive(Serialize, Deserialize, Debug)]
struct PriceQuote {
    item: String,
    gold: i32,
}

impl Message for PriceQuote {
    const TYPE_NAME: &'static str = "Demo.PriceQuote";
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let registry = Arc::new(TypeRegistry::new());
    registry.register::<Chat>();
    registry.register::<PriceQuery>();
    registry.register::<PriceQuote>();
    let codec = MessageCodec::new(EnvelopeFormat::Json, registry);

    let listener = TcpListener::bind("127.0.0.1:7777").await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let codec = codec.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, codec).await {
                tracing::warn!("Connection from {} ended: {}", addr, e);
            }
        });
    }
}

async fn serve(
    mut stream: TcpStream,
    codec: MessageCodec,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let session_id = Handshake::new().welcome_from_receiver(&mut stream).await?;
    tracing::info!("Session {} attached", session_id);

    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; 8 * 1024];
    let mut next_id: u16 = 0;

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            tracing::info!("Session {} detached", session_id);
            return Ok(());
        }

        for frame in buffer.push(&chunk[..n])? {
            if frame.kind() == FrameKind::Ack {
                continue;
            }
            stream.write_all(&Frame::ack(frame.id()).encode()?).await?;

            let message = match codec.decode(frame.payload()) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Undecodable payload in frame {}: {}", frame.id(), e);
                    continue;
                }
            };

            next_id = next_id.checked_add(1).unwrap_or(1);
            let reply = match frame.kind() {
                FrameKind::Data => match message.downcast::<Chat>() {
                    Ok(chat) => {
                        tracing::info!("Chat: {}", chat.text);
                        let echo = Chat {
                            text: format!("echo: {}", chat.text),
                        };
                        Frame::data(next_id, Bytes::from(codec.encode(&echo)?))
                    }
                    Err(other) => {
                        tracing::debug!("Ignoring {}", other.type_name());
                        continue;
                    }
                },
                FrameKind::Request => match message.downcast::<PriceQuery>() {
                    Ok(query) => {
                        let gold = query.item.len() as i32 * 10;
                        let quote = PriceQuote {
                            item: query.item,
                            gold,
                        };
                        Frame::response(next_id, frame.id(), Bytes::from(codec.encode(&quote)?))
                    }
                    Err(other) => {
                        tracing::debug!("No answer for {}", other.type_name());
                        continue;
                    }
                },
                _ => continue,
            };
            stream.write_all(&reply.encode()?).await?;
        }
        stream.flush().await?;
    }
}
