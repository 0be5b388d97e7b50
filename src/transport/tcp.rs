//! TCP connection setup.
//!
//! Name resolution is left to `tokio::net::TcpStream::connect`, which accepts
//! either a literal address or a host name.

use tokio::net::TcpStream;

use super::FaultStream;
use crate::error::Result;

/// Open a TCP connection to `host:port` with Nagle disabled.
///
/// The returned stream is already wrapped for fault classification.
pub async fn connect_tcp(host: &str, port: u16) -> Result<FaultStream<TcpStream>> {
    tracing::debug!("Connecting to {}:{}", host, port);

    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    Ok(FaultStream::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut stream = connect_tcp("127.0.0.1", port).await.unwrap();
        assert!(stream.get_ref().nodelay().unwrap());
        stream.write_all(b"hi").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(connect_tcp("127.0.0.1", port).await.is_err());
    }
}
