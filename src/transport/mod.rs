//! # Transports
//!
//! One [`Transport`] implementation per wire protocol (UDP, TCP, HTTP,
//! HTTPS) plus the dual-stack [`racer`] that runs attempt sequences
//! against candidate servers and returns the first verified response.
//!
//! Transports move opaque enveloped bytes; message semantics, signing, and
//! response verification belong to the resolver. The one shape they share
//! is [`RequestRenderer`]: retries re-render the request so a
//! session-signed resend carries a fresh MAC counter instead of being
//! rejected as a counter replay.

pub mod http;
pub mod racer;
pub mod tcp;
pub mod udp;

pub use racer::{Attempt, RaceOutcome, RacerConfig, ResponseValidator, TransportRacer};

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::core::envelope::Envelope;
use crate::error::Result;

/// Produces the enveloped bytes for one send attempt.
pub trait RequestRenderer: Send + Sync {
    fn render(&self) -> BoxFuture<'_, Result<(Envelope, Vec<u8>)>>;
}

/// Renderer for unsigned or presigned requests whose bytes do not change
/// across retries.
pub struct FixedRequest {
    pub envelope: Envelope,
    pub message: Vec<u8>,
}

impl RequestRenderer for FixedRequest {
    fn render(&self) -> BoxFuture<'_, Result<(Envelope, Vec<u8>)>> {
        Box::pin(async move { Ok((self.envelope, self.message.clone())) })
    }
}

/// One request/response exchange over a concrete wire protocol.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send the rendered request to `server` and return the response
    /// envelope and reassembled message bytes. `path` is the
    /// handle-derived URI path, used only by the HTTP transports.
    fn exchange<'a>(
        &'a self,
        server: SocketAddr,
        path: &'a str,
        request: &'a dyn RequestRenderer,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(Envelope, Vec<u8>)>>;
}
