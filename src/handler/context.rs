//! Request context for handlers.
//!
//! Provides methods for answering a peer's request:
//! - `respond` - encode a value into an envelope and send it as a RESPONSE
//! - `respond_bytes` - send a pre-encoded envelope
//!
//! # Example
//!
//! ```ignore
//! async fn price_handler(query: PriceQuery, ctx: RequestContext) -> Result<()> {
//!     ctx.respond(&PriceQuote { item: query.item, gold: 12 }).await
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{DecodedMessage, Message, MessageCodec};
use crate::error::Result;
use crate::protocol::ReliableProtocol;

/// Context passed to request handlers.
///
/// The response is itself a reliable message: it is acknowledged by the
/// peer and resent after a reconnect like any other send.
///
/// `RequestContext` is `Clone`; answering more than once sends more than one
/// RESPONSE frame and the peer keeps only the first.
#[derive(Clone)]
pub struct RequestContext {
    /// Id of the REQUEST frame being answered.
    request_id: u16,
    /// Protocol and codec for sending the answer.
    responder: Option<(Arc<ReliableProtocol>, MessageCodec)>,
}

impl RequestContext {
    /// Create a context that discards responses (for testing handlers).
    pub fn new(request_id: u16) -> Self {
        Self {
            request_id,
            responder: None,
        }
    }

    /// Create a context that answers through `protocol`.
    pub fn with_protocol(
        request_id: u16,
        protocol: Arc<ReliableProtocol>,
        codec: MessageCodec,
    ) -> Self {
        Self {
            request_id,
            responder: Some((protocol, codec)),
        }
    }

    #[inline]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Send `value` as the response.
    pub async fn respond<T: Message>(&self, value: &T) -> Result<()> {
        let Some((_, codec)) = &self.responder else {
            return Ok(());
        };
        let payload = codec.encode(value)?;
        self.respond_bytes(Bytes::from(payload)).await
    }

    /// Send an already encoded envelope as the response.
    pub async fn respond_bytes(&self, payload: Bytes) -> Result<()> {
        let Some((protocol, _)) = &self.responder else {
            return Ok(());
        };
        protocol.respond(self.request_id, payload).await?;
        Ok(())
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("detached", &self.responder.is_none())
            .finish()
    }
}

/// A decoded request from the peer, waiting for an answer.
#[derive(Debug)]
pub struct IncomingRequest {
    message: DecodedMessage,
    context: RequestContext,
}

impl IncomingRequest {
    pub fn new(message: DecodedMessage, context: RequestContext) -> Self {
        Self { message, context }
    }

    #[inline]
    pub fn request_id(&self) -> u16 {
        self.context.request_id()
    }

    pub fn message(&self) -> &DecodedMessage {
        &self.message
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Answer the request with `value`.
    pub async fn respond<T: Message>(&self, value: &T) -> Result<()> {
        self.context.respond(value).await
    }

    pub fn into_parts(self) -> (DecodedMessage, RequestContext) {
        (self.message, self.context)
    }
}
