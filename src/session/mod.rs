//! # Session Management
//!
//! Tracks authenticated session state per (server, identity) pair: the
//! negotiated symmetric key and algorithm, the protocol version, a strictly
//! increasing MAC counter on each side for replay defense, and expiry.
//!
//! Sessions are created by the key-exchange handshake in [`exchange`],
//! destroyed on timeout, server-reported failure, or explicit teardown, and
//! never shared across identities. A session failure response tears the
//! session down; the resolution engine then retries once on a fresh
//! session before surfacing the error.

pub mod exchange;

pub use exchange::{
    generate_session_key, seal_session_key, unseal_session_key, ClientExchange, SealedKey,
    ALG_SESSION_DH, ALG_SESSION_SEALED, SESSION_KEY_LENGTH,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::auth::mac::{session_signature, verify_session_mac};
use crate::core::codec::EncodedMessage;
use crate::core::message::{MessageBody, ProtocolVersion, SessionKeyMode, SignatureBlock};
use crate::error::{HandleError, Result};

/// What a session is keyed by: one server, one identity. An anonymous
/// client uses the empty identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionScope {
    pub server: SocketAddr,
    pub identity: String,
}

impl SessionScope {
    pub fn new(server: SocketAddr, identity: impl Into<String>) -> Self {
        Self {
            server,
            identity: identity.into(),
        }
    }

    pub fn anonymous(server: SocketAddr) -> Self {
        Self::new(server, "")
    }
}

/// One established session.
pub struct Session {
    pub session_id: u32,
    pub version: ProtocolVersion,
    pub algorithm: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
    /// Counter for the next outbound MAC; strictly increasing.
    next_counter: u32,
    /// Highest inbound counter accepted so far; a received counter must
    /// exceed this or the message is a replay.
    last_accepted: u32,
    created_at: Instant,
    timeout: Duration,
}

impl Session {
    pub fn new(
        session_id: u32,
        version: ProtocolVersion,
        algorithm: Vec<u8>,
        key: Zeroizing<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            version,
            algorithm,
            key,
            next_counter: 1,
            last_accepted: 0,
            created_at: Instant::now(),
            timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.timeout
    }

    /// Sign an outbound message with the session key, consuming one counter
    /// value. Each retry of the same logical request must call this again so
    /// the resend carries a fresh counter.
    pub fn sign(&mut self, encoded: &EncodedMessage) -> SignatureBlock {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        session_signature(&self.key, encoded, counter)
    }

    /// Verify an inbound MAC and enforce counter ordering.
    pub fn verify(&mut self, encoded: &EncodedMessage, block: &SignatureBlock) -> Result<()> {
        verify_session_mac(&self.key, encoded, block)?;
        if block.session_counter <= self.last_accepted {
            debug!(
                counter = block.session_counter,
                last = self.last_accepted,
                "replayed session counter"
            );
            return Err(HandleError::SessionReplay);
        }
        self.last_accepted = block.session_counter;
        Ok(())
    }

    #[cfg(test)]
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// A completed setup handshake: the session itself, plus the key-exchange
/// message that must still be sent when the server handed out its public
/// key instead of completing a Diffie-Hellman derivation.
pub struct EstablishedSession {
    pub session: Session,
    pub follow_up: Option<MessageBody>,
}

/// Build the setup request body. With `use_dh` the client opens with its
/// own exchange key and the returned [`ClientExchange`] must be kept for
/// [`complete_setup`].
pub fn setup_request(timeout_seconds: u32, use_dh: bool) -> (MessageBody, Option<ClientExchange>) {
    if use_dh {
        let exchange = ClientExchange::generate();
        let body = MessageBody::SessionSetup {
            timeout_seconds,
            exchange_public_key: exchange.public_key().to_vec(),
        };
        (body, Some(exchange))
    } else {
        (
            MessageBody::SessionSetup {
                timeout_seconds,
                exchange_public_key: Vec::new(),
            },
            None,
        )
    }
}

/// Turn a setup response into an established session.
///
/// Versions before 2.7 do not encode the symmetric algorithm on the wire
/// and assume the fixed legacy one; from 2.7 on the server's reported
/// algorithm is honored.
pub fn complete_setup(
    session_id: u32,
    version: ProtocolVersion,
    mode: SessionKeyMode,
    response_algorithm: &[u8],
    response_data: &[u8],
    exchange: Option<ClientExchange>,
    timeout: Duration,
) -> Result<EstablishedSession> {
    let algorithm = |fallback: &[u8]| -> Vec<u8> {
        if version.at_least(2, 7) && !response_algorithm.is_empty() {
            response_algorithm.to_vec()
        } else {
            fallback.to_vec()
        }
    };
    match mode {
        SessionKeyMode::DiffieHellman => {
            let exchange = exchange.ok_or_else(|| {
                HandleError::Session("server completed an exchange the client never opened".into())
            })?;
            let key = exchange.derive(response_data)?;
            Ok(EstablishedSession {
                session: Session::new(session_id, version, algorithm(ALG_SESSION_DH), key, timeout),
                follow_up: None,
            })
        }
        SessionKeyMode::ServerPublicKey => {
            let key = generate_session_key();
            let sealed = seal_session_key(response_data, &key)?;
            let follow_up = MessageBody::SessionExchangeKey {
                algorithm: ALG_SESSION_SEALED.to_vec(),
                ephemeral_public_key: sealed.ephemeral_public_key,
                nonce: sealed.nonce,
                sealed_key: sealed.sealed_key,
            };
            Ok(EstablishedSession {
                session: Session::new(
                    session_id,
                    version,
                    algorithm(ALG_SESSION_SEALED),
                    key,
                    timeout,
                ),
                follow_up: Some(follow_up),
            })
        }
    }
}

/// Thread-safe registry of live sessions, bounded and TTL-evicted.
#[derive(Clone)]
pub struct SessionManager {
    max_sessions: usize,
    default_timeout: Duration,
    inner: Arc<Mutex<HashMap<SessionScope, Session>>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, default_timeout: Duration) -> Self {
        Self {
            max_sessions,
            default_timeout,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Store an established session, evicting expired entries first and the
    /// oldest live one if still over capacity.
    pub async fn store(&self, scope: SessionScope, session: Session) {
        let mut inner = self.inner.lock().await;
        inner.retain(|_, s| !s.is_expired());
        if inner.len() >= self.max_sessions && !inner.contains_key(&scope) {
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, s)| s.created_at)
                .map(|(k, _)| k.clone())
            {
                debug!(server = %oldest.server, "evicting oldest session");
                inner.remove(&oldest);
            }
        }
        trace!(server = %scope.server, session_id = session.session_id, "session stored");
        inner.insert(scope, session);
    }

    /// The live session id for a scope, if one exists.
    pub async fn session_id(&self, scope: &SessionScope) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        match inner.get(scope) {
            Some(session) if !session.is_expired() => Some(session.session_id),
            Some(_) => {
                inner.remove(scope);
                None
            }
            None => None,
        }
    }

    /// Sign `encoded` with the scope's live session, if any. Returns the
    /// session id and signature block.
    pub async fn sign(
        &self,
        scope: &SessionScope,
        encoded: &EncodedMessage,
    ) -> Option<(u32, SignatureBlock)> {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(scope) {
            Some(session) if !session.is_expired() => {
                Some((session.session_id, session.sign(encoded)))
            }
            Some(_) => {
                inner.remove(scope);
                None
            }
            None => None,
        }
    }

    /// Verify an inbound session-MAC'd message for a scope. Fails with
    /// [`HandleError::Session`] if no live session exists.
    pub async fn verify(
        &self,
        scope: &SessionScope,
        encoded: &EncodedMessage,
        block: &SignatureBlock,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .get_mut(scope)
            .filter(|s| !s.is_expired())
            .ok_or_else(|| HandleError::Session("no live session for scope".into()))?;
        session.verify(encoded, block)
    }

    /// Tear a session down (timeout, server-reported failure, explicit
    /// terminate).
    pub async fn remove(&self, scope: &SessionScope) {
        let mut inner = self.inner.lock().await;
        if inner.remove(scope).is_some() {
            debug!(server = %scope.server, "session torn down");
        }
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode_message;
    use crate::core::message::{MessageBuilder, CLIENT_VERSION};

    fn scope() -> SessionScope {
        SessionScope::anonymous("192.0.2.1:2641".parse().unwrap())
    }

    fn encoded() -> EncodedMessage {
        encode_message(
            &MessageBuilder::request(MessageBody::Resolution {
                handle: "100/test".into(),
                types: vec![],
                indexes: vec![],
            })
            .session(42)
            .request_id(1)
            .build(),
        )
    }

    fn session(timeout: Duration) -> Session {
        Session::new(
            42,
            CLIENT_VERSION,
            ALG_SESSION_DH.to_vec(),
            generate_session_key(),
            timeout,
        )
    }

    #[test]
    fn counters_increase_and_replays_rejected() {
        let mut s = session(Duration::from_secs(60));
        let encoded = encoded();
        let first = s.sign(&encoded);
        let second = s.sign(&encoded);
        assert_eq!(first.session_counter, 1);
        assert_eq!(second.session_counter, 2);
        assert_ne!(first.signature, second.signature);

        let mut verifier = Session::new(
            42,
            CLIENT_VERSION,
            ALG_SESSION_DH.to_vec(),
            Zeroizing::new(s.key().to_vec()),
            Duration::from_secs(60),
        );
        verifier.verify(&encoded, &first).unwrap();
        verifier.verify(&encoded, &second).unwrap();
        assert!(matches!(
            verifier.verify(&encoded, &first),
            Err(HandleError::SessionReplay)
        ));
    }

    #[test]
    fn dh_setup_produces_session_without_follow_up() {
        let (body, exchange) = setup_request(3600, true);
        let MessageBody::SessionSetup {
            exchange_public_key,
            ..
        } = &body
        else {
            panic!("wrong body");
        };
        assert_eq!(exchange_public_key.len(), 32);

        // Fake server side of the exchange.
        let server = ClientExchange::generate();
        let server_public = server.public_key();
        let established = complete_setup(
            7,
            CLIENT_VERSION,
            SessionKeyMode::DiffieHellman,
            ALG_SESSION_DH,
            &server_public,
            exchange,
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(established.follow_up.is_none());
        assert_eq!(established.session.session_id, 7);

        let server_key = server.derive(exchange_public_key).unwrap();
        assert_eq!(established.session.key(), &*server_key);
    }

    #[test]
    fn server_key_setup_requires_follow_up() {
        let server_secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        let server_public = x25519_dalek::PublicKey::from(&server_secret).to_bytes();
        let established = complete_setup(
            8,
            CLIENT_VERSION,
            SessionKeyMode::ServerPublicKey,
            b"",
            &server_public,
            None,
            Duration::from_secs(60),
        )
        .unwrap();
        let Some(MessageBody::SessionExchangeKey {
            ephemeral_public_key,
            nonce,
            sealed_key,
            ..
        }) = established.follow_up
        else {
            panic!("missing key-exchange follow-up");
        };
        let unsealed =
            unseal_session_key(&server_secret, &ephemeral_public_key, &nonce, &sealed_key).unwrap();
        assert_eq!(established.session.key(), &*unsealed);
    }

    #[test]
    fn dh_response_without_client_exchange_is_error() {
        assert!(complete_setup(
            1,
            CLIENT_VERSION,
            SessionKeyMode::DiffieHellman,
            b"",
            &[0u8; 32],
            None,
            Duration::from_secs(60),
        )
        .is_err());
    }

    #[tokio::test]
    async fn manager_scopes_sessions_by_identity() {
        let manager = SessionManager::new(16, Duration::from_secs(60));
        let anon = scope();
        let admin = SessionScope::new(anon.server, "0.NA/10");
        manager.store(anon.clone(), session(Duration::from_secs(60))).await;
        assert_eq!(manager.session_id(&anon).await, Some(42));
        assert_eq!(manager.session_id(&admin).await, None);
    }

    #[tokio::test]
    async fn expired_sessions_are_not_handed_out() {
        let manager = SessionManager::new(16, Duration::from_secs(60));
        let scope = scope();
        manager.store(scope.clone(), session(Duration::ZERO)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.session_id(&scope).await, None);
        assert!(manager.sign(&scope, &encoded()).await.is_none());
    }

    #[tokio::test]
    async fn teardown_removes_session() {
        let manager = SessionManager::new(16, Duration::from_secs(60));
        let scope = scope();
        manager.store(scope.clone(), session(Duration::from_secs(60))).await;
        manager.remove(&scope).await;
        assert!(manager.is_empty().await);
    }
}
