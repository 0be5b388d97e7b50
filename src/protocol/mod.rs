//! Protocol module - handshake, framing and reliable delivery.
//!
//! - [`Handshake`] negotiates the version and the [`SessionId`]
//! - [`Header`] / [`Frame`] / [`FrameBuffer`] implement the delivery framing
//! - [`ReliableProtocol`] tracks pending messages, acknowledgments, liveness
//!   and request/response correlation across reattached streams

mod frame;
mod frame_buffer;
mod handshake;
mod reliable;
mod session_id;
mod wire_format;

pub use frame::{check_payload_size, Frame};
pub use frame_buffer::FrameBuffer;
pub use handshake::{Handshake, HANDSHAKE_VERSION, SIGNAL_BAD_VERSION, SIGNAL_VERSION_OK};
pub use reliable::{
    DisconnectCause, PendingMessage, ProtocolConfig, ProtocolContact, ProtocolState,
    ReliableProtocol, DEFAULT_ACK_TIMEOUT,
};
pub use session_id::SessionId;
pub use wire_format::{
    message_type, FrameKind, Header, DEFAULT_MESSAGE_ID, MAX_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
