//! Transport module - TCP connection setup and fault classification.
//!
//! Provides:
//! - [`FaultStream`] - wraps any async byte stream and classifies failures
//! - [`FaultSwitch`] - shared control to force a stream into its error state
//! - [`connect_tcp`] - opens a TCP connection ready for the handshake

mod fault_stream;
mod tcp;

pub use fault_stream::{FaultStream, FaultSwitch};
pub use tcp::connect_tcp;
