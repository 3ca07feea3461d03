//! Dual-stack connection racing.
//!
//! Candidates arrive as an ordered list of (server, protocol) attempts.
//! They are partitioned into IPv6 and IPv4 groups; when both stacks are
//! viable and racing is enabled, the two groups run as independently
//! cancellable attempt sequences, IPv6 immediately and IPv4 after a short
//! handicap. The first attempt to produce a response that passes the
//! caller's validator wins and cancels the other side; a losing sequence
//! checks the token before each blocking step and before committing a
//! parsed response. If the leader fails outright, the follower's result —
//! success or error — is what the caller gets.

use std::net::SocketAddr;
use std::pin::pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::core::envelope::Envelope;
use crate::error::{HandleError, Result};
use crate::transport::http::HttpTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{RequestRenderer, Transport};
use crate::types::InterfaceProtocol;

/// One concrete thing to try: a server address over a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub server: SocketAddr,
    pub protocol: InterfaceProtocol,
}

/// Response validation hook: decode the bytes, check signatures against the
/// answering server's key, reject expired messages. Run before a racer
/// commits a response as the winner.
pub type ResponseValidator<'a> =
    &'a (dyn Fn(SocketAddr, &Envelope, &[u8]) -> Result<()> + Send + Sync);

#[derive(Debug, Clone)]
pub struct RacerConfig {
    /// Delay before the IPv4 sequence starts when both stacks race.
    pub ipv4_handicap: Duration,
    /// Disabling racing falls back to one serial attempt sequence.
    pub race_enabled: bool,
    pub ipv6_enabled: bool,
    pub ipv4_enabled: bool,
    /// Connect-and-read timeout for stream and HTTP attempts.
    pub stream_timeout: Duration,
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            ipv4_handicap: Duration::from_millis(300),
            race_enabled: true,
            ipv6_enabled: true,
            ipv4_enabled: true,
            stream_timeout: Duration::from_secs(30),
        }
    }
}

/// The winning response of a race.
#[derive(Debug)]
pub struct RaceOutcome {
    pub envelope: Envelope,
    pub message: Vec<u8>,
    pub server: SocketAddr,
    pub elapsed: Duration,
}

pub struct TransportRacer {
    config: RacerConfig,
    udp: UdpTransport,
    tcp: TcpTransport,
    http: HttpTransport,
    https: HttpTransport,
}

impl TransportRacer {
    pub fn new(config: RacerConfig, udp: UdpTransport) -> Self {
        Self {
            config,
            udp,
            tcp: TcpTransport,
            http: HttpTransport::plain(),
            https: HttpTransport::tls(),
        }
    }

    pub fn config(&self) -> &RacerConfig {
        &self.config
    }

    fn transport_for(&self, protocol: InterfaceProtocol) -> &dyn Transport {
        match protocol {
            InterfaceProtocol::Udp => &self.udp,
            InterfaceProtocol::Tcp => &self.tcp,
            InterfaceProtocol::Http => &self.http,
            InterfaceProtocol::Https => &self.https,
        }
    }

    /// Run one attempt sequence to completion or exhaustion, checking the
    /// cancellation token before each attempt and before committing a
    /// response.
    async fn run_group(
        &self,
        attempts: &[Attempt],
        path: &str,
        request: &dyn RequestRenderer,
        validate: ResponseValidator<'_>,
        cancel: &CancellationToken,
    ) -> Result<RaceOutcome> {
        let mut last_error = HandleError::Transport("no candidate servers".into());
        for attempt in attempts {
            if cancel.is_cancelled() {
                return Err(HandleError::RaceLost);
            }
            let transport = self.transport_for(attempt.protocol);
            trace!(server = %attempt.server, protocol = transport.name(), "attempt");
            let started = Instant::now();
            let exchange = transport.exchange(
                attempt.server,
                path,
                request,
                self.config.stream_timeout,
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(HandleError::RaceLost),
                result = exchange => result,
            };
            match result {
                Ok((envelope, message)) => {
                    // Sibling finished while this response was in flight;
                    // drop it rather than committing a second winner.
                    if cancel.is_cancelled() {
                        return Err(HandleError::RaceLost);
                    }
                    match validate(attempt.server, &envelope, &message) {
                        Ok(()) => {
                            return Ok(RaceOutcome {
                                envelope,
                                message,
                                server: attempt.server,
                                elapsed: started.elapsed(),
                            });
                        }
                        Err(err) if err.is_transient() => {
                            debug!(server = %attempt.server, error = %err, "response rejected");
                            last_error = err;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(
                        server = %attempt.server,
                        protocol = transport.name(),
                        error = %err,
                        "attempt failed"
                    );
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }

    /// Send a request across the candidate attempts, racing IPv6 against
    /// IPv4 when both stacks have candidates.
    ///
    /// `ipv4_handicap` is the delay before the IPv4 sequence starts; the
    /// caller zeroes it when a preferred primary on IPv4 is known to
    /// respond faster.
    #[instrument(skip_all, fields(attempts = attempts.len()))]
    pub async fn send(
        &self,
        attempts: &[Attempt],
        path: &str,
        request: &dyn RequestRenderer,
        validate: ResponseValidator<'_>,
        ipv4_handicap: Duration,
    ) -> Result<RaceOutcome> {
        let v6: Vec<Attempt> = attempts
            .iter()
            .filter(|a| self.config.ipv6_enabled && a.server.is_ipv6())
            .copied()
            .collect();
        let v4: Vec<Attempt> = attempts
            .iter()
            .filter(|a| self.config.ipv4_enabled && a.server.is_ipv4())
            .copied()
            .collect();

        let cancel = CancellationToken::new();
        if v6.is_empty() || v4.is_empty() || !self.config.race_enabled {
            // Serial mode: one sequence over whichever group(s) remain, in
            // the caller's preference order.
            let serial: Vec<Attempt> = if !self.config.race_enabled {
                attempts
                    .iter()
                    .filter(|a| {
                        (a.server.is_ipv6() && self.config.ipv6_enabled)
                            || (a.server.is_ipv4() && self.config.ipv4_enabled)
                    })
                    .copied()
                    .collect()
            } else if v6.is_empty() {
                v4
            } else {
                v6
            };
            return self.run_group(&serial, path, request, validate, &cancel).await;
        }

        debug!(v6 = v6.len(), v4 = v4.len(), "racing dual-stack");
        let mut v6_run = pin!(self.run_group(&v6, path, request, validate, &cancel));
        let mut v4_run = pin!(async {
            if !ipv4_handicap.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(HandleError::RaceLost),
                    () = tokio::time::sleep(ipv4_handicap) => {}
                }
            }
            self.run_group(&v4, path, request, validate, &cancel).await
        });

        // First sequence to finish is the leader. A winning leader cancels
        // the follower; a failed leader hands the outcome to the follower.
        tokio::select! {
            leader = &mut v6_run => match leader {
                Ok(outcome) => {
                    cancel.cancel();
                    Ok(outcome)
                }
                Err(err) => {
                    debug!(error = %err, "IPv6 sequence failed, using IPv4 outcome");
                    v4_run.await
                }
            },
            leader = &mut v4_run => match leader {
                Ok(outcome) => {
                    cancel.cancel();
                    Ok(outcome)
                }
                Err(err) => {
                    debug!(error = %err, "IPv4 sequence failed, using IPv6 outcome");
                    v6_run.await
                }
            },
        }
    }
}
