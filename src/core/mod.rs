//! # Core Protocol Components
//!
//! Low-level wire handling: primitive readers/writers, the transport
//! envelope, the message model, and the binary codec.
//!
//! ## Wire Format
//! ```text
//! [Envelope(20)] [Header(24)] [Body(N)] [Signature(4+N)]
//! ```
//!
//! The envelope is repeated per UDP fragment; TCP and HTTP carry the whole
//! message after one envelope.
//!
//! ## Security
//! - All length fields validated against fixed maxima before allocation
//! - Unknown opcode/response-code combinations are protocol errors, never
//!   silently dropped
//! - Expired messages are rejected by callers using the header expiration

pub mod codec;
pub mod envelope;
pub mod message;
pub mod wire;
