//! 128-bit session identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of a logical session.
///
/// Assigned by the receiving side on first contact and presented again on
/// every reconnect. On the wire it uses the GUID byte layout: the first three
/// groups little-endian, the last eight bytes as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Size of the id on the wire.
    pub const WIRE_SIZE: usize = 16;

    /// Generate a fresh random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_wire_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        self.0.to_bytes_le()
    }

    pub fn from_wire_bytes(bytes: [u8; Self::WIRE_SIZE]) -> Self {
        Self(Uuid::from_bytes_le(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
