//! Session handshake: version negotiation and session identity.
//!
//! ```text
//! sender                              receiver
//!   │── version: i16 ───────────────────▶│
//!   │◀────────────── signal: i16 (1 ok, 2 bad version)
//!   │── has_id: bool [, id: 16 bytes] ──▶│
//!   │◀──────────── id: 16 bytes (only when has_id = false)
//! ```
//!
//! Each round trip is buffered and flushed as one write. A version mismatch
//! is fatal. A stream closed locally while the exchange is running means the
//! caller abandoned the attempt and surfaces as
//! [`SessionwireError::HandshakeCanceled`]; anything else unexpected is
//! wrapped in [`SessionwireError::UnknownProtocol`].

use tokio::io::{AsyncRead, AsyncWrite};

use super::SessionId;
use crate::codec::{BinaryReader, BinaryWriter};
use crate::error::{Result, SessionwireError, StreamFault};

/// Handshake protocol version spoken by this crate.
pub const HANDSHAKE_VERSION: i16 = 1;

/// Receiver accepted the offered version.
pub const SIGNAL_VERSION_OK: i16 = 1;

/// Receiver rejected the offered version.
pub const SIGNAL_BAD_VERSION: i16 = 2;

/// Handshake runner for one protocol version.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    version: i16,
}

impl Handshake {
    /// Handshake speaking [`HANDSHAKE_VERSION`].
    pub fn new() -> Self {
        Self {
            version: HANDSHAKE_VERSION,
        }
    }

    /// Handshake speaking a custom version (mismatch testing, migrations).
    pub fn with_version(version: i16) -> Self {
        Self { version }
    }

    pub fn version(&self) -> i16 {
        self.version
    }

    /// Run the connecting side of the handshake.
    ///
    /// With `prior` set the id is offered for restoration and returned
    /// verbatim; otherwise the peer assigns a fresh id.
    pub async fn welcome_from_sender<S>(
        &self,
        stream: &mut S,
        prior: Option<SessionId>,
    ) -> Result<SessionId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.sender_exchange(stream, prior)
            .await
            .map_err(classify_handshake_error)
    }

    /// Run the accepting side of the handshake.
    pub async fn welcome_from_receiver<S>(&self, stream: &mut S) -> Result<SessionId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.receiver_exchange(stream)
            .await
            .map_err(classify_handshake_error)
    }

    async fn sender_exchange<S>(&self, stream: &mut S, prior: Option<SessionId>) -> Result<SessionId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut writer = BinaryWriter::with_capacity(1 + SessionId::WIRE_SIZE);

        writer.write_i16(self.version);
        writer.flush_to(stream).await?;

        let signal = BinaryReader::new(stream).read_i16().await?;
        if signal != SIGNAL_VERSION_OK {
            return Err(SessionwireError::VersionMismatch {
                local: self.version,
            });
        }

        match prior {
            Some(id) => {
                writer.write_bool(true).write_session_id(&id);
                writer.flush_to(stream).await?;
                Ok(id)
            }
            None => {
                writer.write_bool(false);
                writer.flush_to(stream).await?;
                BinaryReader::new(stream).read_session_id().await
            }
        }
    }

    async fn receiver_exchange<S>(&self, stream: &mut S) -> Result<SessionId>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut writer = BinaryWriter::with_capacity(SessionId::WIRE_SIZE);

        let offered = BinaryReader::new(stream).read_i16().await?;
        if offered != self.version {
            writer.write_i16(SIGNAL_BAD_VERSION);
            writer.flush_to(stream).await?;
            return Err(SessionwireError::VersionMismatch {
                local: self.version,
            });
        }

        writer.write_i16(SIGNAL_VERSION_OK);
        writer.flush_to(stream).await?;

        let mut reader = BinaryReader::new(stream);
        if reader.read_bool().await? {
            return reader.read_session_id().await;
        }

        let id = SessionId::new_random();
        writer.write_session_id(&id);
        writer.flush_to(stream).await?;
        Ok(id)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_handshake_error(err: SessionwireError) -> SessionwireError {
    match err {
        SessionwireError::VersionMismatch { .. } | SessionwireError::HandshakeCanceled => err,
        SessionwireError::ConnectionClosedLocally => SessionwireError::HandshakeCanceled,
        SessionwireError::Io(io) => match StreamFault::classify(&io) {
            StreamFault::ClosedLocally => SessionwireError::HandshakeCanceled,
            _ => SessionwireError::unknown(io),
        },
        other => SessionwireError::unknown(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FaultStream;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_fresh_session_gets_id_from_receiver() {
        let (client, server) = duplex(256);
        let mut client = FaultStream::new(client);
        let mut server = FaultStream::new(server);

        let receiver = tokio::spawn(async move {
            Handshake::new().welcome_from_receiver(&mut server).await
        });

        let assigned = Handshake::new()
            .welcome_from_sender(&mut client, None)
            .await
            .unwrap();

        assert_eq!(receiver.await.unwrap().unwrap(), assigned);
    }

    #[tokio::test]
    async fn test_prior_id_is_restored_verbatim() {
        let (client, server) = duplex(256);
        let mut client = FaultStream::new(client);
        let mut server = FaultStream::new(server);
        let prior = SessionId::new_random();

        let receiver = tokio::spawn(async move {
            Handshake::new().welcome_from_receiver(&mut server).await
        });

        let restored = Handshake::new()
            .welcome_from_sender(&mut client, Some(prior))
            .await
            .unwrap();

        assert_eq!(restored, prior);
        assert_eq!(receiver.await.unwrap().unwrap(), prior);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal_and_no_id_exchanged() {
        let (client, server) = duplex(256);
        let mut client = FaultStream::new(client);
        let mut server = FaultStream::new(server);

        let receiver = tokio::spawn(async move {
            let result = Handshake::new().welcome_from_receiver(&mut server).await;
            // Nothing beyond the version must arrive.
            let mut rest = Vec::new();
            let _ = server.read_to_end(&mut rest).await;
            (result, rest)
        });

        let err = Handshake::with_version(7)
            .welcome_from_sender(&mut client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionwireError::VersionMismatch { local: 7 }));
        assert!(err.is_fatal());
        drop(client);

        let (result, rest) = receiver.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionwireError::VersionMismatch { local: 1 })
        ));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_local_close_is_canceled() {
        let (client, _server) = duplex(256);
        let mut client = FaultStream::new(client);
        client.switch().close_locally();

        let err = Handshake::new()
            .welcome_from_sender(&mut client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionwireError::HandshakeCanceled));
    }

    #[tokio::test]
    async fn test_peer_drop_is_wrapped_unknown_error() {
        let (client, server) = duplex(256);
        let mut client = FaultStream::new(client);
        drop(server);

        let err = Handshake::new()
            .welcome_from_sender(&mut client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionwireError::UnknownProtocol(_)));
    }
}
