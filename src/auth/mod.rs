//! # Message Authentication
//!
//! MAC and asymmetric-signature generation and verification over encoded
//! message bytes, plus the credential trait used to answer server
//! challenges.
//!
//! ## Format Eras
//! Three mutually incompatible signature formats coexist on the wire and
//! are selected by the message's negotiated protocol version:
//! - before 2.5: plain SHA-1 digest of `key ∥ header ∥ body`
//! - 2.5 through 2.6: single-pass SHA-1 with the key embedded on *both*
//!   sides of the payload (kept bit-for-bit for interoperability with
//!   servers of that era; see [`mac`])
//! - 2.7 and later: HMAC-SHA256 over version/session/request/counter/body
//!
//! Asymmetric signatures mirror the same byte scope and carry the
//! algorithm identifier in the signature block so the verifier can select
//! the matching check.

pub mod mac;
pub mod signature;

pub use mac::{mac_algorithm, session_signature, verify_session_mac, MacEra};
pub use signature::{
    answer_challenge, compute_request_digest, sign_message, verify_challenge_answer,
    verify_message_signature, verify_request_digest, AuthenticationCredential, Ed25519Credential,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch seconds, saturating at zero before the epoch.
pub fn now_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
