//! # sessionwire
//!
//! Client SDK for durable sessions over TCP.
//!
//! A session survives dropped connections: the server hands out a session
//! id during the handshake, the client offers it again on reconnect, and
//! every message that was not acknowledged yet is resent in order.
//!
//! ## Layers
//!
//! - **Transport** ([`transport`]): TCP streams wrapped so that every
//!   failure is classified (closed locally, closed remotely, lost)
//! - **Handshake** ([`protocol::Handshake`]): protocol version check and
//!   session id exchange
//! - **Reliable delivery** ([`protocol::ReliableProtocol`]): DATA / ACK /
//!   REQUEST / RESPONSE frames, acknowledgment timeout, resend after
//!   reconnect
//! - **Envelopes** ([`codec`]): typed messages tagged with a hash of their
//!   type name, encoded as JSON or MessagePack
//! - **Session** ([`Client`]): connect, reconnect, dispose, typed sends and
//!   handler dispatch
//!
//! ## Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use sessionwire::{Client, Message, SessionEvent};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Message for Chat {
//!     const TYPE_NAME: &'static str = "Chat.Line";
//! }
//!
//! #[tokio::main]
//! async fn main() -> sessionwire::Result<()> {
//!     let mut client = Client::builder()
//!         .server("127.0.0.1", 7777)
//!         .reconnect(true)
//!         .message::<Chat>()
//!         .start()
//!         .await?;
//!
//!     client.connect().await?;
//!     client.send_message(&Chat { text: "hello".into() }).await?;
//!
//!     while let Some(event) = client.next_event().await {
//!         if let SessionEvent::Disposed { .. } = event {
//!             break;
//!         }
//!         client.dispatch(event).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;
pub mod writer;

mod client;

pub use client::{Client, ClientBuilder, SessionEvent, SessionHandle};
pub use codec::{DecodedMessage, EnvelopeFormat, Message};
pub use config::ClientConfig;
pub use error::{Result, SessionwireError, StreamFault};
pub use handler::{IncomingRequest, RequestContext};
pub use protocol::{DisconnectCause, ProtocolState, SessionId};
