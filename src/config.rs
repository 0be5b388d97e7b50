//! Client configuration.
//!
//! [`ClientConfig`] can be built in code (usually through
//! [`ClientBuilder`](crate::ClientBuilder)) or loaded from a JSON document.
//! Missing fields take their defaults; durations are integer milliseconds.
//!
//! ```
//! use std::time::Duration;
//! use sessionwire::ClientConfig;
//!
//! let config = ClientConfig::from_json_str(
//!     r#"{ "server_host": "play.example.net", "reconnect": true, "ack_timeout": 2500 }"#,
//! ).unwrap();
//! assert_eq!(config.server_port, 7777);
//! assert_eq!(config.ack_timeout, Duration::from_millis(2500));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::EnvelopeFormat;
use crate::error::Result;
use crate::protocol::{ProtocolConfig, DEFAULT_ACK_TIMEOUT};
use crate::writer::WriterConfig;

pub const DEFAULT_SERVER_HOST: &str = "localhost";
pub const DEFAULT_SERVER_PORT: u16 = 7777;
pub const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_secs(5);

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the server.
    pub server_host: String,
    pub server_port: u16,
    /// Connect as soon as the client starts.
    pub auto_connect: bool,
    /// Reconnect (and resend pending messages) when the connection is lost.
    pub reconnect: bool,
    /// Keep retrying after a failed connection attempt.
    pub repeat_connection_attempts: bool,
    /// How long a sent message may stay unacknowledged.
    #[serde(with = "duration_millis")]
    pub ack_timeout: Duration,
    /// Pause between connection attempts.
    #[serde(with = "duration_millis")]
    pub reconnection_delay: Duration,
    pub envelope_format: EnvelopeFormat,
    pub writer: WriterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            auto_connect: true,
            reconnect: false,
            repeat_connection_attempts: false,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            envelope_format: EnvelopeFormat::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Settings for the delivery protocol.
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            ack_timeout: self.ack_timeout,
            writer: self.writer.clone(),
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
