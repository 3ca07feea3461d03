//! # Handle Protocol Client
//!
//! Client-side implementation of the handle resolution protocol: a binary
//! request/response codec, three generations of message authentication,
//! authenticated sessions with key exchange and replay defense, and a
//! resolution engine that discovers the service responsible for a handle
//! and races it over IPv6 and IPv4.
//!
//! ## Features
//! - **Binary codec**: fixed 20-byte envelope plus 24-byte header, every
//!   field length-prefixed and bounds-checked before allocation
//! - **Authentication**: version-gated MAC formats, Ed25519 signatures,
//!   challenge/response flows
//! - **Sessions**: X25519 key exchange, strictly increasing MAC counters,
//!   transparent repair after server-side session loss
//! - **Resolution**: prefix discovery through authority handles, referral
//!   chains with cycle detection, positive and negative caching
//! - **Transports**: UDP with fragmentation and retry, TCP, HTTP(S), all
//!   behind a dual-stack racer with cooperative cancellation
//!
//! ## Quick Start
//! ```no_run
//! use handle_protocol::config::ClientConfig;
//! use handle_protocol::resolver::ResolutionEngine;
//!
//! # async fn run() -> handle_protocol::Result<()> {
//! let config = ClientConfig::default();
//! let engine = ResolutionEngine::new(&config)?;
//! let values = engine.resolve("100/test", &[b"URL".to_vec()], &[]).await?;
//! for value in values {
//!     println!("{} {}", value.index, String::from_utf8_lossy(&value.data));
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod types;

pub use config::ClientConfig;
pub use core::codec::{decode_message, encode_message, EncodedMessage};
pub use core::envelope::Envelope;
pub use core::message::{
    Message, MessageBody, MessageBuilder, OpCode, OpFlags, ProtocolVersion, ResponseCode,
    CLIENT_VERSION,
};
pub use error::{HandleError, Result};
pub use resolver::{ResolutionEngine, ResolutionOptions};
pub use types::{HandleValue, SiteInfo};
