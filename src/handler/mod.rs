//! Handler module - typed dispatch of decoded messages and requests.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps message type hashes to handlers
//! - [`RequestContext`] - lets request handlers send the response
//! - [`IncomingRequest`] - a decoded request plus its context
//!
//! Handlers never run on the protocol's read loop. The host receives
//! messages as events and calls [`Client::dispatch`](crate::Client::dispatch)
//! on its own task.

mod context;
mod registry;

pub use context::{IncomingRequest, RequestContext};
pub use registry::{
    BoxFuture, Handler, HandlerRegistry, HandlerResult, RequestHandler, TypedHandler,
};
