//! Session MAC computation across the three historical format eras.

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;

use crate::core::codec::EncodedMessage;
use crate::core::message::{ProtocolVersion, SignatureBlock};
use crate::error::{HandleError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Algorithm identifier for the pre-2.7 SHA-1 digest MACs.
pub const ALG_MAC_SHA1: &[u8] = b"SHA1";
/// Algorithm identifier for the HMAC-SHA256 MAC used from 2.7 on.
pub const ALG_MAC_HMAC_SHA256: &[u8] = b"HMAC-SHA256";

/// Which MAC format a protocol version selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacEra {
    /// Before 2.5: `SHA1(key ∥ header ∥ body)`.
    Legacy,
    /// 2.5 through 2.6: `SHA1(key ∥ fields ∥ body ∥ key)` in a single pass,
    /// key on both sides. Wrong by modern standards, reproduced exactly for
    /// wire compatibility with servers of that era. Do not strengthen.
    KeyWrapped,
    /// 2.7 and later: HMAC-SHA256 over the field scope.
    Hmac,
}

impl MacEra {
    pub fn for_version(version: ProtocolVersion) -> Self {
        let v = version.effective();
        if v.at_least(2, 7) {
            MacEra::Hmac
        } else if v.at_least(2, 5) {
            MacEra::KeyWrapped
        } else {
            MacEra::Legacy
        }
    }
}

/// Algorithm identifier a session MAC carries for the given version.
pub fn mac_algorithm(version: ProtocolVersion) -> &'static [u8] {
    match MacEra::for_version(version) {
        MacEra::Legacy | MacEra::KeyWrapped => ALG_MAC_SHA1,
        MacEra::Hmac => ALG_MAC_HMAC_SHA256,
    }
}

/// The field scope shared by the key-wrapped and HMAC eras: version bytes,
/// session id, request id, session counter. From 2.8 on the sender's
/// suggested version is covered as well.
fn field_scope(encoded: &EncodedMessage, counter: u32) -> Vec<u8> {
    let message = &encoded.message;
    let mut scope = Vec::with_capacity(16 + encoded.body().len());
    scope.push(message.version.major);
    scope.push(message.version.minor);
    if message.version.at_least(2, 8) {
        scope.push(message.suggested_version.major);
        scope.push(message.suggested_version.minor);
    }
    scope.extend_from_slice(&message.session_id.to_be_bytes());
    scope.extend_from_slice(&message.request_id.to_be_bytes());
    scope.extend_from_slice(&counter.to_be_bytes());
    scope
}

/// Compute the session MAC for an encoded message under the era selected by
/// its version.
pub fn compute_mac(key: &[u8], encoded: &EncodedMessage, counter: u32) -> Vec<u8> {
    match MacEra::for_version(encoded.message.version) {
        MacEra::Legacy => {
            let mut hasher = Sha1::new();
            hasher.update(key);
            hasher.update(encoded.header());
            hasher.update(encoded.body());
            hasher.finalize().to_vec()
        }
        MacEra::KeyWrapped => {
            let mut hasher = Sha1::new();
            hasher.update(key);
            hasher.update(field_scope(encoded, counter));
            hasher.update(encoded.body());
            hasher.update(key);
            hasher.finalize().to_vec()
        }
        MacEra::Hmac => {
            // HMAC accepts keys of any length.
            let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
            mac.update(&field_scope(encoded, counter));
            mac.update(encoded.body());
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Build the signature block for a session-MAC'd message.
pub fn session_signature(key: &[u8], encoded: &EncodedMessage, counter: u32) -> SignatureBlock {
    SignatureBlock {
        algorithm: mac_algorithm(encoded.message.version).to_vec(),
        signer_handle: String::new(),
        signer_index: 0,
        session_counter: counter,
        signature: compute_mac(key, encoded, counter),
    }
}

/// Verify a session MAC against the encoded message it arrived on.
///
/// The counter covered by the MAC is taken from the block itself; replay
/// ordering of counters is the session layer's concern, not this check's.
pub fn verify_session_mac(
    key: &[u8],
    encoded: &EncodedMessage,
    block: &SignatureBlock,
) -> Result<()> {
    let expected_alg = mac_algorithm(encoded.message.version);
    if block.algorithm != expected_alg {
        debug!(
            algorithm = %String::from_utf8_lossy(&block.algorithm),
            "MAC algorithm does not match negotiated version"
        );
        return Err(HandleError::InvalidSignature);
    }
    let expected = compute_mac(key, encoded, block.session_counter);
    if expected.len() != block.signature.len() {
        return Err(HandleError::InvalidSignature);
    }
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(&block.signature) {
        diff |= a ^ b;
    }
    if diff != 0 {
        return Err(HandleError::InvalidSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode_message;
    use crate::core::message::{MessageBody, MessageBuilder};

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn encoded_at(version: ProtocolVersion) -> EncodedMessage {
        let mut message = MessageBuilder::request(MessageBody::Resolution {
            handle: "100/test".into(),
            types: vec![b"URL".to_vec()],
            indexes: vec![],
        })
        .version(version)
        .session(5)
        .request_id(77)
        .build();
        message.suggested_version = version;
        encode_message(&message)
    }

    #[test]
    fn era_selection() {
        assert_eq!(
            MacEra::for_version(ProtocolVersion::new(2, 4)),
            MacEra::Legacy
        );
        assert_eq!(
            MacEra::for_version(ProtocolVersion::new(5, 0)),
            MacEra::Legacy
        );
        assert_eq!(
            MacEra::for_version(ProtocolVersion::new(2, 5)),
            MacEra::KeyWrapped
        );
        assert_eq!(
            MacEra::for_version(ProtocolVersion::new(2, 6)),
            MacEra::KeyWrapped
        );
        assert_eq!(MacEra::for_version(ProtocolVersion::new(2, 7)), MacEra::Hmac);
        assert_eq!(
            MacEra::for_version(ProtocolVersion::new(2, 11)),
            MacEra::Hmac
        );
    }

    #[test]
    fn mac_is_deterministic_and_counter_sensitive() {
        for version in [
            ProtocolVersion::new(2, 0),
            ProtocolVersion::new(2, 5),
            ProtocolVersion::new(2, 7),
            ProtocolVersion::new(2, 11),
        ] {
            let encoded = encoded_at(version);
            let first = compute_mac(KEY, &encoded, 1);
            let second = compute_mac(KEY, &encoded, 1);
            assert_eq!(first, second, "same counter must produce identical MACs");
            if version.at_least(2, 5) {
                let bumped = compute_mac(KEY, &encoded, 2);
                assert_ne!(first, bumped, "counter must change the MAC");
            }
        }
    }

    #[test]
    fn eras_disagree_with_each_other() {
        let old = compute_mac(KEY, &encoded_at(ProtocolVersion::new(2, 4)), 1);
        let broken = compute_mac(KEY, &encoded_at(ProtocolVersion::new(2, 5)), 1);
        let modern = compute_mac(KEY, &encoded_at(ProtocolVersion::new(2, 7)), 1);
        assert_ne!(old, broken);
        assert_ne!(broken, modern);
        assert_eq!(old.len(), 20);
        assert_eq!(broken.len(), 20);
        assert_eq!(modern.len(), 32);
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let encoded = encoded_at(ProtocolVersion::new(2, 11));
        let block = session_signature(KEY, &encoded, 3);
        verify_session_mac(KEY, &encoded, &block).unwrap();

        let mut other = MessageBuilder::request(MessageBody::Resolution {
            handle: "100/other".into(),
            types: vec![b"URL".to_vec()],
            indexes: vec![],
        })
        .version(ProtocolVersion::new(2, 11))
        .session(5)
        .request_id(77)
        .build();
        other.suggested_version = ProtocolVersion::new(2, 11);
        let tampered = encode_message(&other);
        assert!(matches!(
            verify_session_mac(KEY, &tampered, &block),
            Err(HandleError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_rejects_wrong_key_and_wrong_algorithm() {
        let encoded = encoded_at(ProtocolVersion::new(2, 11));
        let block = session_signature(KEY, &encoded, 3);
        assert!(verify_session_mac(b"wrong key", &encoded, &block).is_err());

        let mut wrong_alg = block;
        wrong_alg.algorithm = ALG_MAC_SHA1.to_vec();
        assert!(verify_session_mac(KEY, &encoded, &wrong_alg).is_err());
    }

    #[test]
    fn suggested_version_covered_from_two_eight() {
        let encoded = encoded_at(ProtocolVersion::new(2, 11));
        let baseline = compute_mac(KEY, &encoded, 1);
        let mut shifted = encoded.message.clone();
        shifted.suggested_version = ProtocolVersion::new(2, 8);
        let shifted = encode_message(&shifted);
        assert_ne!(baseline, compute_mac(KEY, &shifted, 1));
    }
}
