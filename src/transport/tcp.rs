//! Stream transport: one envelope, the whole message, one response.

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::core::envelope::{Envelope, ENVELOPE_LENGTH};
use crate::error::{HandleError, Result};
use crate::transport::{RequestRenderer, Transport};

pub struct TcpTransport;

impl TcpTransport {
    async fn attempt(
        server: SocketAddr,
        envelope: Envelope,
        message: &[u8],
    ) -> Result<(Envelope, Vec<u8>)> {
        let mut stream = TcpStream::connect(server).await?;
        trace!(%server, bytes = message.len(), "stream connected");

        let mut env = envelope;
        env.truncated = false;
        env.sequence_number = 0;
        env.message_length = message.len() as u32;
        stream.write_all(&env.encode()).await?;
        stream.write_all(message).await?;
        stream.flush().await?;

        let mut env_buf = [0u8; ENVELOPE_LENGTH];
        stream.read_exact(&mut env_buf).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                HandleError::ConnectionClosed
            } else {
                HandleError::Io(err)
            }
        })?;
        let response_env = Envelope::decode(&env_buf)?;
        let mut body = vec![0u8; response_env.message_length as usize];
        stream.read_exact(&mut body).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                HandleError::ConnectionClosed
            } else {
                HandleError::Io(err)
            }
        })?;
        Ok((response_env, body))
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn exchange<'a>(
        &'a self,
        server: SocketAddr,
        _path: &'a str,
        request: &'a dyn RequestRenderer,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(Envelope, Vec<u8>)>> {
        Box::pin(async move {
            let (envelope, message) = request.render().await?;
            tokio::time::timeout(timeout, Self::attempt(server, envelope, &message))
                .await
                .map_err(|_| HandleError::Timeout)?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::ProtocolVersion;
    use crate::transport::FixedRequest;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn stream_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut env_buf = [0u8; ENVELOPE_LENGTH];
            stream.read_exact(&mut env_buf).await.unwrap();
            let env = Envelope::decode(&env_buf).unwrap();
            let mut body = vec![0u8; env.message_length as usize];
            stream.read_exact(&mut body).await.unwrap();
            // Echo the message back under the same envelope.
            stream.write_all(&env_buf).await.unwrap();
            stream.write_all(&body).await.unwrap();
        });

        let request = FixedRequest {
            envelope: Envelope::new(ProtocolVersion::new(2, 11), 3, 21),
            message: b"payload".to_vec(),
        };
        let (env, body) = TcpTransport
            .exchange(addr, "", &request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(env.request_id, 21);
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn early_close_is_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let request = FixedRequest {
            envelope: Envelope::new(ProtocolVersion::new(2, 11), 0, 1),
            message: vec![0u8; 8],
        };
        let result = TcpTransport
            .exchange(addr, "", &request, Duration::from_secs(2))
            .await;
        assert!(matches!(
            result,
            Err(HandleError::ConnectionClosed) | Err(HandleError::Io(_))
        ));
    }
}
