//! Asymmetric signatures, request digests, and challenge answering.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;

use crate::core::codec::EncodedMessage;
use crate::core::message::{DigestAlgorithm, MessageBody, RequestDigest, SignatureBlock};
use crate::error::{HandleError, Result};

/// Algorithm identifier for Ed25519 signature blocks.
pub const ALG_ED25519: &[u8] = b"ED25519";

/// An identity able to sign challenges and messages.
///
/// This is the seam between the resolution engine and whatever holds key
/// material: a key file, an HSM shim, a test double.
pub trait AuthenticationCredential: Send + Sync {
    /// Handle identifying the signer, e.g. `300:0.NA/10`s admin handle.
    fn user_handle(&self) -> &str;
    /// Value index of the signer's public key within that handle.
    fn user_index(&self) -> u32;
    /// Wire algorithm identifier for signatures this credential produces.
    fn algorithm(&self) -> &'static [u8];
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Ed25519 keypair credential.
pub struct Ed25519Credential {
    handle: String,
    index: u32,
    key: SigningKey,
}

impl Ed25519Credential {
    pub fn new(handle: impl Into<String>, index: u32, key: SigningKey) -> Self {
        Self {
            handle: handle.into(),
            index,
            key,
        }
    }

    pub fn from_seed(handle: impl Into<String>, index: u32, seed: [u8; 32]) -> Self {
        Self::new(handle, index, SigningKey::from_bytes(&seed))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

impl AuthenticationCredential for Ed25519Credential {
    fn user_handle(&self) -> &str {
        &self.handle
    }

    fn user_index(&self) -> u32 {
        self.index
    }

    fn algorithm(&self) -> &'static [u8] {
        ALG_ED25519
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(data).to_vec())
    }
}

/// Byte scope an asymmetric signature covers. Mirrors the MAC scope of the
/// message's era, minus the key embedding: old versions sign the raw
/// header and body, 2.7+ signs the version/session/request fields plus
/// body.
fn signing_scope(encoded: &EncodedMessage) -> Vec<u8> {
    let message = &encoded.message;
    if message.version.at_least(2, 7) {
        let mut scope = Vec::with_capacity(16 + encoded.body().len());
        scope.push(message.version.major);
        scope.push(message.version.minor);
        if message.version.at_least(2, 8) {
            scope.push(message.suggested_version.major);
            scope.push(message.suggested_version.minor);
        }
        scope.extend_from_slice(&message.session_id.to_be_bytes());
        scope.extend_from_slice(&message.request_id.to_be_bytes());
        scope.extend_from_slice(encoded.body());
        scope
    } else {
        let mut scope = Vec::with_capacity(encoded.header().len() + encoded.body().len());
        scope.extend_from_slice(encoded.header());
        scope.extend_from_slice(encoded.body());
        scope
    }
}

/// Sign an encoded message with an asymmetric credential.
pub fn sign_message(
    credential: &dyn AuthenticationCredential,
    encoded: &EncodedMessage,
) -> Result<SignatureBlock> {
    let signature = credential.sign(&signing_scope(encoded))?;
    Ok(SignatureBlock {
        algorithm: credential.algorithm().to_vec(),
        signer_handle: credential.user_handle().to_string(),
        signer_index: credential.user_index(),
        session_counter: 0,
        signature,
    })
}

/// Verify an asymmetric signature block against the signer's public key.
pub fn verify_message_signature(
    public_key: &[u8],
    encoded: &EncodedMessage,
    block: &SignatureBlock,
) -> Result<()> {
    if block.algorithm != ALG_ED25519 {
        debug!(
            algorithm = %String::from_utf8_lossy(&block.algorithm),
            "unsupported signature algorithm"
        );
        return Err(HandleError::InvalidSignature);
    }
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| HandleError::InvalidSignature)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| HandleError::InvalidSignature)?;
    let signature =
        Signature::from_slice(&block.signature).map_err(|_| HandleError::InvalidSignature)?;
    key.verify(&signing_scope(encoded), &signature)
        .map_err(|_| HandleError::InvalidSignature)
}

/// Digest the canonical request bytes for the response's request-digest
/// block.
pub fn compute_request_digest(algorithm: DigestAlgorithm, request_bytes: &[u8]) -> RequestDigest {
    let digest = match algorithm {
        DigestAlgorithm::Sha1 => Sha1::digest(request_bytes).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(request_bytes).to_vec(),
    };
    RequestDigest { algorithm, digest }
}

/// Recompute and compare a response's request digest against the request
/// bytes actually sent. A mismatch means the request was altered in flight
/// and is a hard security failure, never a retry condition.
pub fn verify_request_digest(digest: &RequestDigest, request_bytes: &[u8]) -> Result<()> {
    let expected = compute_request_digest(digest.algorithm, request_bytes);
    if expected.digest != digest.digest {
        return Err(HandleError::RequestDigestMismatch);
    }
    Ok(())
}

/// Answer a server challenge: sign the challenge nonce concatenated with
/// the digest of the original request, identifying the credential.
pub fn answer_challenge(
    credential: &dyn AuthenticationCredential,
    nonce: &[u8],
    request_digest: &[u8],
) -> Result<MessageBody> {
    let mut signed = Vec::with_capacity(nonce.len() + request_digest.len());
    signed.extend_from_slice(nonce);
    signed.extend_from_slice(request_digest);
    let answer = credential.sign(&signed)?;
    Ok(MessageBody::ChallengeAnswer {
        auth_type: credential.algorithm().to_vec(),
        user_handle: credential.user_handle().to_string(),
        user_index: credential.user_index(),
        answer,
    })
}

/// Verify a challenge answer with the answering identity's public key.
/// Used both by tests and by the verify-challenge flow, where a client
/// checks another party's answer on a server's behalf.
pub fn verify_challenge_answer(
    public_key: &[u8],
    nonce: &[u8],
    request_digest: &[u8],
    answer: &[u8],
) -> Result<()> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| HandleError::InvalidSignature)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| HandleError::InvalidSignature)?;
    let signature = Signature::from_slice(answer).map_err(|_| HandleError::InvalidSignature)?;
    let mut signed = Vec::with_capacity(nonce.len() + request_digest.len());
    signed.extend_from_slice(nonce);
    signed.extend_from_slice(request_digest);
    key.verify(&signed, &signature)
        .map_err(|_| HandleError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode_message;
    use crate::core::message::{MessageBuilder, ProtocolVersion};

    fn credential() -> Ed25519Credential {
        Ed25519Credential::from_seed("0.NA/10", 300, [7u8; 32])
    }

    fn encoded() -> EncodedMessage {
        encode_message(
            &MessageBuilder::request(MessageBody::Resolution {
                handle: "10/object".into(),
                types: vec![],
                indexes: vec![],
            })
            .request_id(9)
            .build(),
        )
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let cred = credential();
        let encoded = encoded();
        let block = sign_message(&cred, &encoded).unwrap();
        assert_eq!(block.signer_handle, "0.NA/10");
        assert_eq!(block.signer_index, 300);
        verify_message_signature(&cred.public_key_bytes(), &encoded, &block).unwrap();
    }

    #[test]
    fn verify_rejects_other_message_and_other_key() {
        let cred = credential();
        let block = sign_message(&cred, &encoded()).unwrap();

        let other = encode_message(
            &MessageBuilder::request(MessageBody::GetSiteInfo)
                .request_id(9)
                .build(),
        );
        assert!(verify_message_signature(&cred.public_key_bytes(), &other, &block).is_err());

        let other_key = Ed25519Credential::from_seed("0.NA/10", 300, [8u8; 32]);
        assert!(
            verify_message_signature(&other_key.public_key_bytes(), &encoded(), &block).is_err()
        );
    }

    #[test]
    fn legacy_scope_covers_header() {
        // Pre-2.7 signatures cover the raw header, so changing any header
        // byte (here the recursion count) must invalidate them.
        let cred = credential();
        let build = |count: u8| {
            encode_message(
                &MessageBuilder::request(MessageBody::GetSiteInfo)
                    .version(ProtocolVersion::new(2, 4))
                    .recursion_count(count)
                    .build(),
            )
        };
        let block = sign_message(&cred, &build(0)).unwrap();
        verify_message_signature(&cred.public_key_bytes(), &build(0), &block).unwrap();
        assert!(verify_message_signature(&cred.public_key_bytes(), &build(1), &block).is_err());
    }

    #[test]
    fn request_digest_mismatch_is_fatal() {
        let digest = compute_request_digest(DigestAlgorithm::Sha256, b"request bytes");
        verify_request_digest(&digest, b"request bytes").unwrap();
        assert!(matches!(
            verify_request_digest(&digest, b"tampered bytes"),
            Err(HandleError::RequestDigestMismatch)
        ));
        let sha1 = compute_request_digest(DigestAlgorithm::Sha1, b"request bytes");
        assert_eq!(sha1.digest.len(), 20);
    }

    #[test]
    fn challenge_answer_verifies() {
        let cred = credential();
        let body = answer_challenge(&cred, b"nonce", b"digest").unwrap();
        let MessageBody::ChallengeAnswer {
            auth_type,
            user_handle,
            user_index,
            answer,
        } = body
        else {
            panic!("wrong body kind");
        };
        assert_eq!(auth_type, ALG_ED25519);
        assert_eq!(user_handle, "0.NA/10");
        assert_eq!(user_index, 300);
        verify_challenge_answer(&cred.public_key_bytes(), b"nonce", b"digest", &answer).unwrap();
        assert!(
            verify_challenge_answer(&cred.public_key_bytes(), b"other", b"digest", &answer)
                .is_err()
        );
    }
}
