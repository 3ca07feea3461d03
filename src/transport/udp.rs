//! Datagram transport with fragmentation and escalating retries.

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::core::envelope::{fragment, Envelope, Reassembler, ENVELOPE_LENGTH};
use crate::error::{HandleError, Result};
use crate::transport::{RequestRenderer, Transport};

/// Default maximum datagram payload after the envelope.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

/// Default escalating per-attempt timeouts. All fragments are resent on
/// each retry, re-rendered so a session-signed request gets a fresh
/// counter.
pub const DEFAULT_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(1500),
];

pub struct UdpTransport {
    max_payload: usize,
    retry_schedule: Vec<Duration>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD, DEFAULT_RETRY_SCHEDULE.to_vec())
    }
}

impl UdpTransport {
    pub fn new(max_payload: usize, retry_schedule: Vec<Duration>) -> Self {
        Self {
            max_payload: max_payload.max(1),
            retry_schedule,
        }
    }

    async fn attempt(
        &self,
        server: SocketAddr,
        envelope: Envelope,
        message: &[u8],
        timeout: Duration,
    ) -> Result<(Envelope, Vec<u8>)> {
        let bind_addr: SocketAddr = if server.is_ipv6() {
            "[::]:0".parse().map_err(|_| HandleError::Transport("bind address".into()))?
        } else {
            "0.0.0.0:0".parse().map_err(|_| HandleError::Transport("bind address".into()))?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;

        let datagrams = fragment(&envelope, message, self.max_payload);
        trace!(fragments = datagrams.len(), %server, "sending datagrams");
        for datagram in &datagrams {
            socket.send(datagram).await?;
        }

        let mut reassembler = Reassembler::new(envelope.request_id);
        let mut buf = vec![0u8; ENVELOPE_LENGTH + self.max_payload.max(64 * 1024)];
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| HandleError::Timeout)??;
            if let Some((env, bytes)) = reassembler.push(&buf[..received])? {
                return Ok((env, bytes));
            }
        }
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn exchange<'a>(
        &'a self,
        server: SocketAddr,
        _path: &'a str,
        request: &'a dyn RequestRenderer,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(Envelope, Vec<u8>)>> {
        Box::pin(async move {
            let schedule: Vec<Duration> = if self.retry_schedule.is_empty() {
                vec![timeout]
            } else {
                self.retry_schedule.clone()
            };
            let mut last_error = HandleError::Timeout;
            for (attempt, per_try) in schedule.iter().enumerate() {
                let (envelope, message) = request.render().await?;
                match self.attempt(server, envelope, &message, *per_try).await {
                    Ok(done) => return Ok(done),
                    Err(err) if err.is_transient() => {
                        debug!(%server, attempt, error = %err, "datagram attempt failed");
                        last_error = err;
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(last_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::ProtocolVersion;

    struct CountingRenderer {
        envelope: Envelope,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl RequestRenderer for CountingRenderer {
        fn render(&self) -> BoxFuture<'_, Result<(Envelope, Vec<u8>)>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move { Ok((self.envelope, vec![1, 2, 3])) })
        }
    }

    #[tokio::test]
    async fn echo_server_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let transport = UdpTransport::default();
        let envelope = Envelope::new(ProtocolVersion::new(2, 11), 0, 99);
        let request = FixedEcho { envelope };
        let (env, bytes) = transport
            .exchange(server_addr, "", &request, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(env.request_id, 99);
        assert_eq!(bytes, vec![7, 8, 9]);
    }

    struct FixedEcho {
        envelope: Envelope,
    }

    impl RequestRenderer for FixedEcho {
        fn render(&self) -> BoxFuture<'_, Result<(Envelope, Vec<u8>)>> {
            Box::pin(async move {
                let mut env = self.envelope;
                env.message_length = 3;
                Ok((env, vec![7, 8, 9]))
            })
        }
    }

    #[tokio::test]
    async fn each_retry_re_renders() {
        // Nothing listens on this socket; every attempt times out.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap();

        let transport = UdpTransport::new(
            512,
            vec![Duration::from_millis(20), Duration::from_millis(20)],
        );
        let renderer = CountingRenderer {
            envelope: Envelope::new(ProtocolVersion::new(2, 11), 0, 1),
            calls: std::sync::atomic::AtomicUsize::new(0),
        };
        let result = transport
            .exchange(addr, "", &renderer, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(HandleError::Timeout)));
        assert_eq!(renderer.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
