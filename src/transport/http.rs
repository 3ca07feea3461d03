//! HTTP(S) transport: the enveloped message travels as a POST body.
//!
//! The URI path is derived from the handle under resolution; the response
//! body carries an ordinary envelope + message, identical to the stream
//! transport's framing.

use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::trace;

use crate::core::envelope::{Envelope, ENVELOPE_LENGTH};
use crate::error::{HandleError, Result};
use crate::transport::{RequestRenderer, Transport};

const CONTENT_TYPE: &str = "application/octet-stream";

pub struct HttpTransport {
    client: Client,
    https: bool,
}

impl HttpTransport {
    pub fn new(client: Client, https: bool) -> Self {
        Self { client, https }
    }

    pub fn plain() -> Self {
        Self::new(Client::new(), false)
    }

    pub fn tls() -> Self {
        Self::new(Client::new(), true)
    }

    fn url(&self, server: SocketAddr, path: &str) -> String {
        let scheme = if self.https { "https" } else { "http" };
        let path = path.trim_start_matches('/');
        format!("{scheme}://{server}/{path}")
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    fn exchange<'a>(
        &'a self,
        server: SocketAddr,
        path: &'a str,
        request: &'a dyn RequestRenderer,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(Envelope, Vec<u8>)>> {
        Box::pin(async move {
            let (envelope, message) = request.render().await?;
            let mut env = envelope;
            env.truncated = false;
            env.sequence_number = 0;
            env.message_length = message.len() as u32;

            let mut body = Vec::with_capacity(ENVELOPE_LENGTH + message.len());
            body.extend_from_slice(&env.encode());
            body.extend_from_slice(&message);

            let url = self.url(server, path);
            trace!(%url, bytes = body.len(), "posting message");
            let response = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
                .body(body)
                .timeout(timeout)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(HandleError::Transport(format!(
                    "server answered HTTP {}",
                    response.status()
                )));
            }
            let bytes = response.bytes().await?;
            if bytes.len() < ENVELOPE_LENGTH {
                return Err(HandleError::InvalidEnvelope);
            }
            let response_env = Envelope::decode(&bytes)?;
            let message = bytes[ENVELOPE_LENGTH..].to_vec();
            if message.len() != response_env.message_length as usize {
                return Err(HandleError::Protocol(
                    "HTTP body length does not match envelope message length".into(),
                ));
            }
            Ok((response_env, message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_shapes() {
        let transport = HttpTransport::plain();
        let server: SocketAddr = "192.0.2.5:8000".parse().unwrap();
        assert_eq!(
            transport.url(server, "api/handles/100%2Ftest"),
            "http://192.0.2.5:8000/api/handles/100%2Ftest"
        );
        let tls = HttpTransport::tls();
        assert!(tls.url(server, "/x").starts_with("https://"));
    }
}
