//! Session key establishment primitives.
//!
//! Two establishment paths exist, selected by the server's setup response:
//! an x25519 Diffie-Hellman derivation (both sides derive the key, nothing
//! secret crosses the wire), and a sealed-key path where the client mints a
//! random session key and seals it to the server's public key with an
//! ephemeral x25519 exchange plus ChaCha20-Poly1305.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{HandleError, Result};

/// Length of a derived symmetric session key.
pub const SESSION_KEY_LENGTH: usize = 32;

/// Algorithm identifier for Diffie-Hellman-derived session keys.
pub const ALG_SESSION_DH: &[u8] = b"X25519-HKDF-SHA256";
/// Algorithm identifier for client-minted keys sealed to the server key.
pub const ALG_SESSION_SEALED: &[u8] = b"X25519-CHACHA20POLY1305";

const KDF_INFO: &[u8] = b"handle-session-key";

/// Client side of an in-flight x25519 exchange. Consumed on derivation;
/// the ephemeral secret never outlives the handshake.
pub struct ClientExchange {
    secret: EphemeralSecret,
    public: [u8; 32],
}

impl ClientExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Complete the exchange against the server's ephemeral public key and
    /// derive the session key.
    pub fn derive(self, server_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let server_bytes: [u8; 32] = server_public
            .try_into()
            .map_err(|_| HandleError::Session("server exchange key is not 32 bytes".into()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(server_bytes));
        derive_key(shared.as_bytes())
    }
}

fn derive_key(shared_secret: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new(vec![0u8; SESSION_KEY_LENGTH]);
    hkdf.expand(KDF_INFO, &mut key)
        .map_err(|_| HandleError::Session("session key derivation failed".into()))?;
    Ok(key)
}

/// Mint a fresh random session key.
pub fn generate_session_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; SESSION_KEY_LENGTH]);
    OsRng.fill_bytes(&mut key);
    key
}

/// A session key sealed to a server's public key, ready to travel in a
/// key-exchange message.
#[derive(Debug, Clone)]
pub struct SealedKey {
    pub ephemeral_public_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub sealed_key: Vec<u8>,
}

/// Seal `session_key` to the server's x25519 public key: ephemeral ECDH,
/// HKDF to a wrapping key, ChaCha20-Poly1305 over the session key.
pub fn seal_session_key(server_public: &[u8], session_key: &[u8]) -> Result<SealedKey> {
    let server_bytes: [u8; 32] = server_public
        .try_into()
        .map_err(|_| HandleError::Session("server public key is not 32 bytes".into()))?;
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(server_bytes));
    let wrap_key = derive_key(shared.as_bytes())?;

    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| HandleError::Session("key wrap setup failed".into()))?;
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), session_key)
        .map_err(|_| HandleError::Session("session key sealing failed".into()))?;

    Ok(SealedKey {
        ephemeral_public_key: ephemeral_public.to_vec(),
        nonce: nonce.to_vec(),
        sealed_key: sealed,
    })
}

/// Reverse of [`seal_session_key`], given the recipient's static secret.
/// The client only needs this to validate its own sealing logic and to act
/// as the verifying party in tests.
pub fn unseal_session_key(
    recipient_secret: &StaticSecret,
    ephemeral_public: &[u8],
    nonce: &[u8],
    sealed_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let ephemeral_bytes: [u8; 32] = ephemeral_public
        .try_into()
        .map_err(|_| HandleError::Session("ephemeral key is not 32 bytes".into()))?;
    let shared = recipient_secret.diffie_hellman(&PublicKey::from(ephemeral_bytes));
    let wrap_key = derive_key(shared.as_bytes())?;
    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| HandleError::Session("key wrap setup failed".into()))?;
    if nonce.len() != 12 {
        return Err(HandleError::Session("sealed key nonce is not 12 bytes".into()));
    }
    let key = cipher
        .decrypt(Nonce::from_slice(nonce), sealed_key)
        .map_err(|_| HandleError::Session("session key unsealing failed".into()))?;
    Ok(Zeroizing::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_derivation_agrees_on_both_sides() {
        let client = ClientExchange::generate();
        let server_secret = EphemeralSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret).to_bytes();

        let client_public: [u8; 32] = client.public_key();
        let client_key = client.derive(&server_public).unwrap();
        let shared = server_secret.diffie_hellman(&PublicKey::from(client_public));
        let server_key = derive_key(shared.as_bytes()).unwrap();

        assert_eq!(&*client_key, &*server_key);
        assert_eq!(client_key.len(), SESSION_KEY_LENGTH);
    }

    #[test]
    fn seal_and_unseal_roundtrip() {
        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret).to_bytes();

        let session_key = generate_session_key();
        let sealed = seal_session_key(&server_public, &session_key).unwrap();
        assert_ne!(sealed.sealed_key, *session_key);

        let unsealed = unseal_session_key(
            &server_secret,
            &sealed.ephemeral_public_key,
            &sealed.nonce,
            &sealed.sealed_key,
        )
        .unwrap();
        assert_eq!(&*unsealed, &*session_key);
    }

    #[test]
    fn tampered_sealed_key_rejected() {
        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret).to_bytes();
        let session_key = generate_session_key();
        let mut sealed = seal_session_key(&server_public, &session_key).unwrap();
        sealed.sealed_key[0] ^= 0xFF;
        assert!(unseal_session_key(
            &server_secret,
            &sealed.ephemeral_public_key,
            &sealed.nonce,
            &sealed.sealed_key,
        )
        .is_err());
    }

    #[test]
    fn short_server_key_rejected() {
        let client = ClientExchange::generate();
        assert!(client.derive(&[1, 2, 3]).is_err());
        assert!(seal_session_key(&[0u8; 16], &generate_session_key()).is_err());
    }
}
