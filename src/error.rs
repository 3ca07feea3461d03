//! # Error Types
//!
//! Error handling for the handle protocol client.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level I/O failures to resolution-level conditions.
//!
//! ## Error Categories
//! - **Protocol errors**: malformed length fields, unknown opcode/response
//!   combinations, truncated buffers — fail fast, never partially applied
//! - **Security errors**: missing/invalid signatures, digest mismatches,
//!   expired messages — fatal for the current attempt, never retried with
//!   weaker checks
//! - **Transient errors**: connect failures, timeouts, lost races — retried
//!   across remaining protocols and sites
//! - **Session errors**: timeouts and invalid keys — trigger one bounded
//!   re-establishment before surfacing
//! - **Application errors**: typed server response codes (handle not found,
//!   permission denied, server busy) — returned as responses, not errors,
//!   except where no response was obtainable at all
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

use crate::core::message::ResponseCode;

/// Primary error type for all handle protocol operations.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message truncated: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("field length {length} exceeds limit {limit}")]
    FieldTooLong { length: usize, limit: usize },

    #[error("unknown message kind: response code {response_code}, opcode {op_code}")]
    UnknownMessageKind { response_code: u32, op_code: u32 },

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("invalid envelope")]
    InvalidEnvelope,

    #[error("message expired")]
    MessageExpired,

    #[error("security error: {0}")]
    Security(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("request digest mismatch")]
    RequestDigestMismatch,

    #[error("response not certified")]
    NotCertified,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("lost connection race")]
    RaceLost,

    #[error("session error: {0}")]
    Session(String),

    #[error("session counter replayed or regressed")]
    SessionReplay,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("recursion limit exceeded while resolving {0}")]
    RecursionLimit(String),

    #[error("no service found for prefix {0}")]
    ServiceNotFound(String),

    #[error("server returned {code:?}: {message}")]
    ServerError { code: ResponseCode, message: String },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP transport error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for HandleError {
    fn from(err: reqwest::Error) -> Self {
        HandleError::Http(err.to_string())
    }
}

impl HandleError {
    /// Whether this error may be retried against another protocol or site.
    ///
    /// Security and protocol errors are final for the attempt that produced
    /// them; only transport-level failures qualify for failover.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HandleError::Io(_)
                | HandleError::Transport(_)
                | HandleError::Timeout
                | HandleError::ConnectionClosed
                | HandleError::RaceLost
                | HandleError::Http(_)
        )
    }
}

/// Type alias for Results using `HandleError`.
pub type Result<T> = std::result::Result<T, HandleError>;
