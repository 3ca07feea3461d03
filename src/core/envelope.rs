//! Transport envelope and UDP fragmentation.
//!
//! The envelope is the fixed 20-byte framing wrapping one protocol message:
//! sent once per UDP fragment, once per TCP or HTTP stream. It is decoupled
//! from the message header — the envelope belongs to the transport, the
//! header to the message.
//!
//! ```text
//! [major(1)] [minor(1)] [flags(2)] [sessionId(4)] [requestId(4)]
//! [sequenceNumber(4)] [messageLength(4)]
//! ```

use bytes::BufMut;

use crate::core::message::ProtocolVersion;
use crate::core::wire::{Reader, MAX_DATA_LENGTH};
use crate::error::{HandleError, Result};

/// Size of the wire envelope in bytes.
pub const ENVELOPE_LENGTH: usize = 20;

/// Envelope flag: message body is compressed. Compression is not produced by
/// this client and is rejected on receive.
pub const ENV_FLAG_COMPRESSED: u16 = 0x8000;
/// Envelope flag: message body is encrypted with the session key.
pub const ENV_FLAG_ENCRYPTED: u16 = 0x4000;
/// Envelope flag: this datagram is one fragment of a larger message.
pub const ENV_FLAG_TRUNCATED: u16 = 0x2000;

/// The fixed transport-level framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub version: ProtocolVersion,
    pub compressed: bool,
    pub encrypted: bool,
    pub truncated: bool,
    pub session_id: u32,
    pub request_id: u32,
    /// Fragment sequence number; 0 for unfragmented messages.
    pub sequence_number: u32,
    /// Total length of the message across all fragments.
    pub message_length: u32,
}

impl Envelope {
    pub fn new(version: ProtocolVersion, session_id: u32, request_id: u32) -> Self {
        Self {
            version,
            compressed: false,
            encrypted: false,
            truncated: false,
            session_id,
            request_id,
            sequence_number: 0,
            message_length: 0,
        }
    }

    pub fn encode(&self) -> [u8; ENVELOPE_LENGTH] {
        let mut out = [0u8; ENVELOPE_LENGTH];
        let mut buf = &mut out[..];
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        let mut flags = 0u16;
        if self.compressed {
            flags |= ENV_FLAG_COMPRESSED;
        }
        if self.encrypted {
            flags |= ENV_FLAG_ENCRYPTED;
        }
        if self.truncated {
            flags |= ENV_FLAG_TRUNCATED;
        }
        buf.put_u16(flags);
        buf.put_u32(self.session_id);
        buf.put_u32(self.request_id);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.message_length);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_LENGTH {
            return Err(HandleError::InvalidEnvelope);
        }
        let mut reader = Reader::new(&bytes[..ENVELOPE_LENGTH]);
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let flags = reader.read_u16()?;
        let session_id = reader.read_u32()?;
        let request_id = reader.read_u32()?;
        let sequence_number = reader.read_u32()?;
        let message_length = reader.read_u32()?;
        if message_length as usize > MAX_DATA_LENGTH {
            return Err(HandleError::FieldTooLong {
                length: message_length as usize,
                limit: MAX_DATA_LENGTH,
            });
        }
        Ok(Self {
            version: ProtocolVersion::new(major, minor),
            compressed: flags & ENV_FLAG_COMPRESSED != 0,
            encrypted: flags & ENV_FLAG_ENCRYPTED != 0,
            truncated: flags & ENV_FLAG_TRUNCATED != 0,
            session_id,
            request_id,
            sequence_number,
            message_length,
        })
    }
}

/// Split a fully encoded message into enveloped UDP datagrams of at most
/// `ENVELOPE_LENGTH + max_payload` bytes each.
pub fn fragment(envelope: &Envelope, message: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
    let chunk = max_payload.max(1);
    let total = message.len() as u32;
    let fragments = message.chunks(chunk).count().max(1);
    message
        .chunks(chunk)
        .enumerate()
        .map(|(seq, part)| {
            let mut env = *envelope;
            env.sequence_number = seq as u32;
            env.truncated = fragments > 1;
            env.message_length = total;
            let mut datagram = Vec::with_capacity(ENVELOPE_LENGTH + part.len());
            datagram.extend_from_slice(&env.encode());
            datagram.extend_from_slice(part);
            datagram
        })
        .collect()
}

/// Reassembly buffer for fragmented UDP responses.
#[derive(Debug)]
pub struct Reassembler {
    request_id: u32,
    envelope: Option<Envelope>,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    total_length: usize,
}

impl Reassembler {
    pub fn new(request_id: u32) -> Self {
        Self {
            request_id,
            envelope: None,
            fragments: Vec::new(),
            received: 0,
            total_length: 0,
        }
    }

    /// Feed one received datagram. Returns the completed message bytes (and
    /// the first fragment's envelope) once every fragment has arrived.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<(Envelope, Vec<u8>)>> {
        let env = Envelope::decode(datagram)?;
        if env.request_id != self.request_id {
            // A stale response to an earlier request; ignore it.
            return Ok(None);
        }
        let payload = &datagram[ENVELOPE_LENGTH..];
        if self.envelope.is_none() {
            self.envelope = Some(env);
            self.total_length = env.message_length as usize;
        }

        if !env.truncated {
            if payload.len() != self.total_length {
                return Err(HandleError::Protocol(
                    "datagram length does not match envelope message length".into(),
                ));
            }
            return Ok(Some((env, payload.to_vec())));
        }

        let seq = env.sequence_number as usize;
        if seq >= crate::core::wire::MAX_ARRAY_SIZE {
            return Err(HandleError::Protocol("fragment sequence out of range".into()));
        }
        if self.fragments.len() <= seq {
            self.fragments.resize(seq + 1, None);
        }
        if self.fragments[seq].is_none() {
            self.received += payload.len();
            self.fragments[seq] = Some(payload.to_vec());
        }

        if self.received < self.total_length {
            return Ok(None);
        }

        let mut message = Vec::with_capacity(self.total_length);
        for fragment in &self.fragments {
            match fragment {
                Some(part) => message.extend_from_slice(part),
                None => return Ok(None), // byte count reached but a gap remains
            }
        }
        if message.len() != self.total_length {
            return Err(HandleError::Protocol(
                "reassembled length does not match envelope message length".into(),
            ));
        }
        let env = self.envelope.ok_or(HandleError::InvalidEnvelope)?;
        Ok(Some((env, message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::new(ProtocolVersion::new(2, 11), 7, 42)
    }

    #[test]
    fn envelope_roundtrip() {
        let mut env = envelope();
        env.encrypted = true;
        env.message_length = 512;
        let bytes = env.encode();
        assert_eq!(bytes.len(), ENVELOPE_LENGTH);
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn short_envelope_rejected() {
        assert!(matches!(
            Envelope::decode(&[0u8; 10]),
            Err(HandleError::InvalidEnvelope)
        ));
    }

    #[test]
    fn single_fragment_when_message_fits() {
        let datagrams = fragment(&envelope(), &[1, 2, 3], 512);
        assert_eq!(datagrams.len(), 1);
        let env = Envelope::decode(&datagrams[0]).unwrap();
        assert!(!env.truncated);
        assert_eq!(env.message_length, 3);
    }

    #[test]
    fn fragmentation_and_reassembly_roundtrip() {
        let message: Vec<u8> = (0..=255).cycle().take(1300).collect();
        let datagrams = fragment(&envelope(), &message, 512);
        assert_eq!(datagrams.len(), 3);

        let mut reassembler = Reassembler::new(42);
        // Deliver out of order; nothing completes until the last arrives.
        assert!(reassembler.push(&datagrams[2]).unwrap().is_none());
        assert!(reassembler.push(&datagrams[0]).unwrap().is_none());
        let (env, rebuilt) = reassembler.push(&datagrams[1]).unwrap().unwrap();
        assert_eq!(rebuilt, message);
        assert_eq!(env.request_id, 42);
    }

    #[test]
    fn duplicate_fragments_ignored() {
        let message = vec![9u8; 1000];
        let datagrams = fragment(&envelope(), &message, 512);
        let mut reassembler = Reassembler::new(42);
        assert!(reassembler.push(&datagrams[0]).unwrap().is_none());
        assert!(reassembler.push(&datagrams[0]).unwrap().is_none());
        let done = reassembler.push(&datagrams[1]).unwrap().unwrap();
        assert_eq!(done.1, message);
    }

    #[test]
    fn foreign_request_id_ignored() {
        let datagrams = fragment(&envelope(), &[1, 2, 3], 512);
        let mut reassembler = Reassembler::new(999);
        assert!(reassembler.push(&datagrams[0]).unwrap().is_none());
    }
}
