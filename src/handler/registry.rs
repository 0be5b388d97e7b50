//! Handler registry for dispatching decoded messages by type hash.
//!
//! Handlers are registered per message type and resolved once, when the
//! host hands a decoded message to [`HandlerRegistry::dispatch_message`] or
//! [`HandlerRegistry::dispatch_request`].
//!
//! # Example
//!
//! ```ignore
//! use sessionwire::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.on(|chat: Chat| async move {
//!     println!("{}: {}", chat.from, chat.text);
//!     Ok(())
//! });
//!
//! registry.on_request(|query: PriceQuery, ctx| async move {
//!     ctx.respond(&PriceQuote { gold: 12 }).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use super::RequestContext;
use crate::codec::{DecodedMessage, Message};
use crate::error::{Result, SessionwireError};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for one-way messages.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, message: DecodedMessage) -> BoxFuture<'static, HandlerResult>;
}

/// Handler for requests that expect a response.
pub trait RequestHandler: Send + Sync + 'static {
    fn call(&self, message: DecodedMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

fn take<T: Message>(message: DecodedMessage) -> Result<T> {
    message.downcast::<T>().map_err(|other| {
        SessionwireError::Protocol(format!(
            "handler for {} received {}",
            T::TYPE_NAME,
            other.type_name()
        ))
    })
}

/// Wrapper that downcasts the decoded message before calling the handler.
pub struct TypedHandler<F, T, Fut> {
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: Message,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: DecodedMessage) -> BoxFuture<'static, HandlerResult> {
        match take::<T>(message) {
            Ok(value) => Box::pin((self.handler)(value)),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

impl<F, T, Fut> RequestHandler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: Message,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: DecodedMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        match take::<T>(message) {
            Ok(value) => Box::pin((self.handler)(value, ctx)),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

/// Registry mapping type hashes to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    messages: HashMap<i32, Box<dyn Handler>>,
    requests: HashMap<i32, Box<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one-way messages of type `T`.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn on<T, F, Fut>(&mut self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: Message,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TypedHandler<F, T, Fut> = TypedHandler::new(handler);
        self.messages.insert(T::type_hash(), Box::new(handler));
    }

    /// Register the handler for requests carrying a `T`.
    pub fn on_request<T, F, Fut>(&mut self, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: Message,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TypedHandler<F, T, Fut> = TypedHandler::new(handler);
        self.requests.insert(T::type_hash(), Box::new(handler));
    }

    pub fn has_handler(&self, type_hash: i32) -> bool {
        self.messages.contains_key(&type_hash)
    }

    pub fn has_request_handler(&self, type_hash: i32) -> bool {
        self.requests.contains_key(&type_hash)
    }

    /// Run the handler registered for `message`'s type.
    ///
    /// Returns `Ok(false)` if no handler is registered.
    pub async fn dispatch_message(&self, message: DecodedMessage) -> Result<bool> {
        let Some(handler) = self.messages.get(&message.type_hash()) else {
            tracing::debug!("No handler for message {}", message.type_name());
            return Ok(false);
        };

        handler.call(message).await?;
        Ok(true)
    }

    /// Run the request handler registered for `message`'s type.
    ///
    /// Returns `Ok(false)` if no handler is registered; the request then
    /// stays unanswered.
    pub async fn dispatch_request(
        &self,
        message: DecodedMessage,
        ctx: RequestContext,
    ) -> Result<bool> {
        let Some(handler) = self.requests.get(&message.type_hash()) else {
            tracing::debug!("No request handler for {}", message.type_name());
            return Ok(false);
        };

        handler.call(message, ctx).await?;
        Ok(true)
    }
}
