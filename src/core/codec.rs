//! Binary message codec.
//!
//! Deterministic encode/decode between [`Message`] values and wire bytes.
//! Encoding is pure and infallible; decoding dispatches on
//! `(response_code, op_code)` and fails fast on anything malformed — unknown
//! kind combinations are protocol errors, never silently dropped bytes.
//!
//! ## Message layout
//! ```text
//! [opCode(4)] [responseCode(4)] [flags(4)] [siteSerial(2)]
//! [recursionCount(1)] [reserved(1)] [expiration(4)] [bodyLength(4)]
//! [body(bodyLength)] [requestDigest?] [signature?]
//! ```
//!
//! The request-digest block is present on responses whose header has the
//! return-request-digest flag set; the signature block is present whenever
//! bytes remain after that. Record codecs for handle values, admin records
//! and site records keep their byte counts in lockstep with the
//! `storage_size` calculators on the corresponding types.

use bytes::BufMut;

use crate::core::envelope::Envelope;
use crate::core::message::{
    DigestAlgorithm, Message, MessageBody, OpCode, OpFlags, ProtocolVersion, RequestDigest,
    ResponseCode, SessionKeyMode, SignatureBlock,
};
use crate::core::wire::{
    put_bytes, put_bytes_array, put_handle, put_u32_array, Reader, MAX_DATA_LENGTH,
    MAX_HANDLE_LENGTH,
};
use crate::error::{HandleError, Result};
use crate::types::{
    AdminPermissions, AdminRecord, Attribute, HandleValue, HashOption, Interface,
    InterfaceProtocol, ServerInfo, SiteInfo, TtlType, ValuePermissions, ValueReference,
};

/// Size of the fixed message header in bytes.
pub const HEADER_LENGTH: usize = 24;

// ---------------------------------------------------------------------------
// Record codecs
// ---------------------------------------------------------------------------

pub fn encode_value_reference(buf: &mut impl BufMut, reference: &ValueReference) {
    put_bytes(buf, &reference.handle);
    buf.put_u32(reference.index);
}

pub fn decode_value_reference(reader: &mut Reader<'_>) -> Result<ValueReference> {
    let handle = reader.read_bytes_bounded(MAX_HANDLE_LENGTH)?;
    let index = reader.read_u32()?;
    Ok(ValueReference { handle, index })
}

pub fn encode_handle_value(buf: &mut impl BufMut, value: &HandleValue) {
    buf.put_u32(value.index);
    buf.put_u32(value.timestamp);
    buf.put_u8(value.ttl_type.to_wire());
    buf.put_u32(value.ttl);
    buf.put_u8(value.permissions.to_wire());
    put_bytes(buf, &value.value_type);
    put_bytes(buf, &value.data);
    buf.put_u32(value.references.len() as u32);
    for reference in &value.references {
        encode_value_reference(buf, reference);
    }
}

pub fn decode_handle_value(reader: &mut Reader<'_>) -> Result<HandleValue> {
    let index = reader.read_u32()?;
    let timestamp = reader.read_u32()?;
    let ttl_type = TtlType::from_wire(reader.read_u8()?)
        .ok_or_else(|| HandleError::Protocol("invalid TTL type".into()))?;
    let ttl = reader.read_u32()?;
    let permissions = ValuePermissions::from_wire(reader.read_u8()?);
    let value_type = reader.read_bytes()?;
    let data = reader.read_bytes()?;
    let ref_count = reader.read_array_len(8)?;
    let mut references = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        references.push(decode_value_reference(reader)?);
    }
    Ok(HandleValue {
        index,
        value_type,
        data,
        ttl_type,
        ttl,
        permissions,
        timestamp,
        references,
    })
}

pub fn encode_value_array(buf: &mut impl BufMut, values: &[HandleValue]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        encode_handle_value(buf, value);
    }
}

pub fn decode_value_array(reader: &mut Reader<'_>) -> Result<Vec<HandleValue>> {
    let count = reader.read_array_len(22)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_handle_value(reader)?);
    }
    Ok(values)
}

pub fn encode_admin_record(buf: &mut impl BufMut, record: &AdminRecord) {
    buf.put_u16(record.permissions.0);
    put_bytes(buf, &record.admin_handle);
    buf.put_u32(record.admin_index);
}

pub fn decode_admin_record(reader: &mut Reader<'_>) -> Result<AdminRecord> {
    let permissions = AdminPermissions(reader.read_u16()?);
    let admin_handle = reader.read_bytes_bounded(MAX_HANDLE_LENGTH)?;
    let admin_index = reader.read_u32()?;
    Ok(AdminRecord {
        permissions,
        admin_handle,
        admin_index,
    })
}

/// Encode an admin record as the data of an `HS_ADMIN` value.
pub fn admin_record_to_bytes(record: &AdminRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.storage_size());
    encode_admin_record(&mut buf, record);
    buf
}

pub fn admin_record_from_bytes(data: &[u8]) -> Result<AdminRecord> {
    decode_admin_record(&mut Reader::new(data))
}

pub fn encode_site_info(buf: &mut impl BufMut, site: &SiteInfo) {
    buf.put_u16(site.data_format_version);
    buf.put_u8(site.protocol_major);
    buf.put_u8(site.protocol_minor);
    buf.put_u16(site.serial);
    buf.put_u8(site.flags_byte());
    buf.put_u8(site.hash_option.to_wire());
    put_bytes(buf, &site.hash_filter);
    buf.put_u32(site.attributes.len() as u32);
    for attribute in &site.attributes {
        put_bytes(buf, &attribute.name);
        put_bytes(buf, &attribute.value);
    }
    buf.put_u32(site.servers.len() as u32);
    for server in &site.servers {
        buf.put_u32(server.server_id);
        buf.put_slice(&server.address);
        put_bytes(buf, &server.public_key);
        buf.put_u32(server.interfaces.len() as u32);
        for interface in &server.interfaces {
            buf.put_u8(interface.service_type);
            buf.put_u8(interface.protocol.to_wire());
            buf.put_u32(interface.port);
        }
    }
}

pub fn decode_site_info(reader: &mut Reader<'_>) -> Result<SiteInfo> {
    let data_format_version = reader.read_u16()?;
    let protocol_major = reader.read_u8()?;
    let protocol_minor = reader.read_u8()?;
    let serial = reader.read_u16()?;
    let flags = reader.read_u8()?;
    let hash_option = HashOption::from_wire(reader.read_u8()?)
        .ok_or_else(|| HandleError::Protocol("invalid hash option".into()))?;
    let hash_filter = reader.read_bytes()?;
    let attribute_count = reader.read_array_len(8)?;
    let mut attributes = Vec::with_capacity(attribute_count);
    for _ in 0..attribute_count {
        let name = reader.read_bytes()?;
        let value = reader.read_bytes()?;
        attributes.push(Attribute { name, value });
    }
    let server_count = reader.read_array_len(28)?;
    let mut servers = Vec::with_capacity(server_count);
    for _ in 0..server_count {
        let server_id = reader.read_u32()?;
        let address: [u8; 16] = reader.read_fixed()?;
        let public_key = reader.read_bytes()?;
        let interface_count = reader.read_array_len(6)?;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            let service_type = reader.read_u8()?;
            let protocol = InterfaceProtocol::from_wire(reader.read_u8()?)
                .ok_or_else(|| HandleError::Protocol("invalid interface protocol".into()))?;
            let port = reader.read_u32()?;
            interfaces.push(Interface {
                service_type,
                protocol,
                port,
            });
        }
        servers.push(ServerInfo {
            server_id,
            address,
            public_key,
            interfaces,
        });
    }
    Ok(SiteInfo {
        data_format_version,
        protocol_major,
        protocol_minor,
        serial,
        is_primary: flags & crate::types::site::SITE_FLAG_PRIMARY != 0,
        multi_primary: flags & crate::types::site::SITE_FLAG_MULTI_PRIMARY != 0,
        hash_option,
        hash_filter,
        attributes,
        servers,
    })
}

/// Encode a site record as the data of an `HS_SITE` value.
pub fn site_info_to_bytes(site: &SiteInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_site_info(&mut buf, site);
    buf
}

pub fn site_info_from_bytes(data: &[u8]) -> Result<SiteInfo> {
    decode_site_info(&mut Reader::new(data))
}

// ---------------------------------------------------------------------------
// Body codecs
// ---------------------------------------------------------------------------

fn encode_body(buf: &mut Vec<u8>, body: &MessageBody) {
    match body {
        MessageBody::Resolution {
            handle,
            types,
            indexes,
        } => {
            put_handle(buf, handle);
            put_bytes_array(buf, types);
            put_u32_array(buf, indexes);
        }
        MessageBody::GetSiteInfo | MessageBody::SessionTerminate | MessageBody::Success => {}
        MessageBody::CreateHandle { handle, values }
        | MessageBody::AddValues { handle, values }
        | MessageBody::ModifyValues { handle, values } => {
            put_handle(buf, handle);
            encode_value_array(buf, values);
        }
        MessageBody::DeleteHandle { handle } => put_handle(buf, handle),
        MessageBody::RemoveValues { handle, indexes } => {
            put_handle(buf, handle);
            put_u32_array(buf, indexes);
        }
        MessageBody::ListHandles { prefix_handle }
        | MessageBody::ListPrefixes { prefix_handle } => put_handle(buf, prefix_handle),
        MessageBody::ChallengeAnswer {
            auth_type,
            user_handle,
            user_index,
            answer,
        } => {
            put_bytes(buf, auth_type);
            put_handle(buf, user_handle);
            buf.put_u32(*user_index);
            put_bytes(buf, answer);
        }
        MessageBody::VerifyChallenge {
            user_handle,
            user_index,
            nonce,
            original_digest,
            answer,
        } => {
            put_handle(buf, user_handle);
            buf.put_u32(*user_index);
            put_bytes(buf, nonce);
            put_bytes(buf, original_digest);
            put_bytes(buf, answer);
        }
        MessageBody::SessionSetup {
            timeout_seconds,
            exchange_public_key,
        } => {
            buf.put_u32(*timeout_seconds);
            put_bytes(buf, exchange_public_key);
        }
        MessageBody::SessionExchangeKey {
            algorithm,
            ephemeral_public_key,
            nonce,
            sealed_key,
        } => {
            put_bytes(buf, algorithm);
            put_bytes(buf, ephemeral_public_key);
            put_bytes(buf, nonce);
            put_bytes(buf, sealed_key);
        }
        MessageBody::ResolutionResponse { handle, values } => {
            put_handle(buf, handle);
            encode_value_array(buf, values);
        }
        MessageBody::GetSiteInfoResponse { site } => encode_site_info(buf, site),
        MessageBody::CreateHandleResponse { minted_handle } => match minted_handle {
            Some(handle) => {
                buf.put_u8(1);
                put_handle(buf, handle);
            }
            None => buf.put_u8(0),
        },
        MessageBody::ListHandlesResponse { handles } => {
            buf.put_u32(handles.len() as u32);
            for handle in handles {
                put_handle(buf, handle);
            }
        }
        MessageBody::ListPrefixesResponse { prefixes } => {
            buf.put_u32(prefixes.len() as u32);
            for prefix in prefixes {
                put_handle(buf, prefix);
            }
        }
        MessageBody::VerifyChallengeResponse { verified } => buf.put_u8(u8::from(*verified)),
        MessageBody::SessionSetupResponse {
            mode,
            algorithm,
            data,
        } => {
            buf.put_u8(mode.to_wire());
            put_bytes(buf, algorithm);
            put_bytes(buf, data);
        }
        MessageBody::Challenge {
            nonce,
            request_digest,
        } => {
            put_bytes(buf, nonce);
            put_bytes(buf, request_digest);
        }
        MessageBody::Error { message, indexes } => {
            put_bytes(buf, message);
            put_u32_array(buf, indexes);
        }
        MessageBody::Referral {
            referral_handle,
            sites,
        } => {
            put_handle(buf, referral_handle);
            buf.put_u32(sites.len() as u32);
            for site in sites {
                encode_site_info(buf, site);
            }
        }
    }
}

fn decode_request_body(op_code: OpCode, reader: &mut Reader<'_>) -> Result<MessageBody> {
    Ok(match op_code {
        OpCode::Resolution => MessageBody::Resolution {
            handle: reader.read_handle()?,
            types: reader.read_bytes_array(MAX_DATA_LENGTH)?,
            indexes: reader.read_u32_array()?,
        },
        OpCode::GetSiteInfo => MessageBody::GetSiteInfo,
        OpCode::CreateHandle => MessageBody::CreateHandle {
            handle: reader.read_handle()?,
            values: decode_value_array(reader)?,
        },
        OpCode::DeleteHandle => MessageBody::DeleteHandle {
            handle: reader.read_handle()?,
        },
        OpCode::AddValues => MessageBody::AddValues {
            handle: reader.read_handle()?,
            values: decode_value_array(reader)?,
        },
        OpCode::RemoveValues => MessageBody::RemoveValues {
            handle: reader.read_handle()?,
            indexes: reader.read_u32_array()?,
        },
        OpCode::ModifyValues => MessageBody::ModifyValues {
            handle: reader.read_handle()?,
            values: decode_value_array(reader)?,
        },
        OpCode::ListHandles => MessageBody::ListHandles {
            prefix_handle: reader.read_handle()?,
        },
        OpCode::ListPrefixes => MessageBody::ListPrefixes {
            prefix_handle: reader.read_handle()?,
        },
        OpCode::ChallengeAnswer => MessageBody::ChallengeAnswer {
            auth_type: reader.read_bytes()?,
            user_handle: reader.read_handle()?,
            user_index: reader.read_u32()?,
            answer: reader.read_bytes()?,
        },
        OpCode::VerifyChallenge => MessageBody::VerifyChallenge {
            user_handle: reader.read_handle()?,
            user_index: reader.read_u32()?,
            nonce: reader.read_bytes()?,
            original_digest: reader.read_bytes()?,
            answer: reader.read_bytes()?,
        },
        OpCode::SessionSetup => MessageBody::SessionSetup {
            timeout_seconds: reader.read_u32()?,
            exchange_public_key: reader.read_bytes()?,
        },
        OpCode::SessionExchangeKey => MessageBody::SessionExchangeKey {
            algorithm: reader.read_bytes()?,
            ephemeral_public_key: reader.read_bytes()?,
            nonce: reader.read_bytes()?,
            sealed_key: reader.read_bytes()?,
        },
        OpCode::SessionTerminate => MessageBody::SessionTerminate,
    })
}

fn decode_success_body(op_code: OpCode, reader: &mut Reader<'_>) -> Result<MessageBody> {
    Ok(match op_code {
        OpCode::Resolution => MessageBody::ResolutionResponse {
            handle: reader.read_handle()?,
            values: decode_value_array(reader)?,
        },
        OpCode::GetSiteInfo => MessageBody::GetSiteInfoResponse {
            site: decode_site_info(reader)?,
        },
        OpCode::CreateHandle => MessageBody::CreateHandleResponse {
            minted_handle: match reader.read_u8()? {
                0 => None,
                _ => Some(reader.read_handle()?),
            },
        },
        OpCode::ListHandles => {
            let count = reader.read_array_len(4)?;
            let mut handles = Vec::with_capacity(count);
            for _ in 0..count {
                handles.push(reader.read_handle()?);
            }
            MessageBody::ListHandlesResponse { handles }
        }
        OpCode::ListPrefixes => {
            let count = reader.read_array_len(4)?;
            let mut prefixes = Vec::with_capacity(count);
            for _ in 0..count {
                prefixes.push(reader.read_handle()?);
            }
            MessageBody::ListPrefixesResponse { prefixes }
        }
        OpCode::VerifyChallenge => MessageBody::VerifyChallengeResponse {
            verified: reader.read_u8()? != 0,
        },
        OpCode::SessionSetup => {
            let mode = SessionKeyMode::from_wire(reader.read_u8()?)
                .ok_or_else(|| HandleError::Protocol("invalid session key mode".into()))?;
            MessageBody::SessionSetupResponse {
                mode,
                algorithm: reader.read_bytes()?,
                data: reader.read_bytes()?,
            }
        }
        // Mutating and session-teardown operations answer with an empty body.
        OpCode::DeleteHandle
        | OpCode::AddValues
        | OpCode::RemoveValues
        | OpCode::ModifyValues
        | OpCode::ChallengeAnswer
        | OpCode::SessionTerminate
        | OpCode::SessionExchangeKey => MessageBody::Success,
    })
}

/// Decode the shared error body.
///
/// Legacy quirk, preserved deliberately: servers speaking the earliest 2.x
/// dialect (including the "major version 5" variant) sometimes answer error
/// codes with an entirely empty body; those decode to an empty error message
/// rather than a truncation failure.
fn decode_error_body(version: ProtocolVersion, reader: &mut Reader<'_>) -> Result<MessageBody> {
    if reader.is_empty() && version.before(2, 1) {
        return Ok(MessageBody::Error {
            message: Vec::new(),
            indexes: Vec::new(),
        });
    }
    let message = reader.read_bytes()?;
    let indexes = if reader.is_empty() {
        Vec::new()
    } else {
        reader.read_u32_array()?
    };
    Ok(MessageBody::Error { message, indexes })
}

fn decode_referral_body(reader: &mut Reader<'_>) -> Result<MessageBody> {
    let referral_handle = reader.read_handle()?;
    let count = reader.read_array_len(8)?;
    let mut sites = Vec::with_capacity(count);
    for _ in 0..count {
        sites.push(decode_site_info(reader)?);
    }
    Ok(MessageBody::Referral {
        referral_handle,
        sites,
    })
}

// ---------------------------------------------------------------------------
// Message codec
// ---------------------------------------------------------------------------

/// A message together with its canonical wire bytes.
///
/// Built once; the body slice is what MAC and signature scopes cover, and
/// the full byte string is what goes on the wire (and what request digests
/// are computed over).
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub message: Message,
    bytes: Vec<u8>,
    body_length: usize,
}

impl EncodedMessage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..HEADER_LENGTH]
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LENGTH..HEADER_LENGTH + self.body_length]
    }
}

/// Encode a message to its canonical byte form (header + body + trailing
/// digest/signature blocks).
pub fn encode_message(message: &Message) -> EncodedMessage {
    let mut body = Vec::new();
    encode_body(&mut body, &message.body);

    let mut bytes = Vec::with_capacity(HEADER_LENGTH + body.len() + 64);
    bytes.put_u32(message.op_code.to_wire());
    bytes.put_u32(message.response_code.to_wire());
    bytes.put_u32(message.flags.to_wire());
    bytes.put_u16(message.site_info_serial);
    bytes.put_u8(message.recursion_count);
    bytes.put_u8(0); // reserved
    bytes.put_u32(message.expiration);
    bytes.put_u32(body.len() as u32);
    let body_length = body.len();
    bytes.extend_from_slice(&body);

    if let Some(digest) = &message.request_digest {
        bytes.put_u8(digest.algorithm.to_wire());
        put_bytes(&mut bytes, &digest.digest);
    }
    if let Some(signature) = &message.signature {
        let mut block = Vec::new();
        put_bytes(&mut block, &signature.algorithm);
        put_handle(&mut block, &signature.signer_handle);
        block.put_u32(signature.signer_index);
        block.put_u32(signature.session_counter);
        block.put_u8(message.suggested_version.major);
        block.put_u8(message.suggested_version.minor);
        put_bytes(&mut block, &signature.signature);
        put_bytes(&mut bytes, &block);
    }

    EncodedMessage {
        message: message.clone(),
        bytes,
        body_length,
    }
}

/// Decode one complete message (header + body + trailing blocks) received
/// under `envelope`.
pub fn decode_message(bytes: &[u8], envelope: &Envelope) -> Result<Message> {
    let mut reader = Reader::new(bytes);
    let op_code_raw = reader.read_u32()?;
    let response_code_raw = reader.read_u32()?;
    let flags = OpFlags::from_wire(reader.read_u32()?);
    let site_info_serial = reader.read_u16()?;
    let recursion_count = reader.read_u8()?;
    let _reserved = reader.read_u8()?;
    let expiration = reader.read_u32()?;
    let body_length = reader.read_u32()? as usize;

    let op_code = OpCode::from_wire(op_code_raw).ok_or(HandleError::UnknownMessageKind {
        response_code: response_code_raw,
        op_code: op_code_raw,
    })?;
    let response_code =
        ResponseCode::from_wire(response_code_raw).ok_or(HandleError::UnknownMessageKind {
            response_code: response_code_raw,
            op_code: op_code_raw,
        })?;

    if body_length > MAX_DATA_LENGTH {
        return Err(HandleError::FieldTooLong {
            length: body_length,
            limit: MAX_DATA_LENGTH,
        });
    }
    if reader.remaining() < body_length {
        return Err(HandleError::Truncated {
            needed: body_length,
            remaining: reader.remaining(),
        });
    }
    let after_header = &bytes[HEADER_LENGTH..];
    let body_bytes = &after_header[..body_length];
    let mut trailer = Reader::new(&after_header[body_length..]);

    let mut body_reader = Reader::new(body_bytes);
    let body = match response_code {
        ResponseCode::Request => decode_request_body(op_code, &mut body_reader)?,
        ResponseCode::Success => decode_success_body(op_code, &mut body_reader)?,
        ResponseCode::ServiceReferral | ResponseCode::PrefixReferral => {
            decode_referral_body(&mut body_reader)?
        }
        ResponseCode::AuthenticationNeeded => MessageBody::Challenge {
            nonce: body_reader.read_bytes()?,
            request_digest: body_reader.read_bytes()?,
        },
        _ => decode_error_body(envelope.version, &mut body_reader)?,
    };
    if !body_reader.is_empty() {
        return Err(HandleError::Protocol(format!(
            "{} trailing bytes after message body",
            body_reader.remaining()
        )));
    }

    let request_digest = if flags.return_request_digest && response_code != ResponseCode::Request {
        let algorithm = DigestAlgorithm::from_wire(trailer.read_u8()?)
            .ok_or_else(|| HandleError::Protocol("invalid digest algorithm".into()))?;
        Some(RequestDigest {
            algorithm,
            digest: trailer.read_bytes()?,
        })
    } else {
        None
    };

    let mut suggested_version = envelope.version;
    let signature = if trailer.is_empty() {
        None
    } else {
        let block_bytes = trailer.read_bytes()?;
        let mut block = Reader::new(&block_bytes);
        let algorithm = block.read_bytes()?;
        let signer_handle = block.read_handle()?;
        let signer_index = block.read_u32()?;
        let session_counter = block.read_u32()?;
        suggested_version = ProtocolVersion::new(block.read_u8()?, block.read_u8()?);
        let signature = block.read_bytes()?;
        Some(SignatureBlock {
            algorithm,
            signer_handle,
            signer_index,
            session_counter,
            signature,
        })
    };
    if !trailer.is_empty() {
        return Err(HandleError::Protocol(
            "trailing bytes after signature block".into(),
        ));
    }

    Ok(Message {
        version: envelope.version,
        suggested_version,
        op_code,
        response_code,
        flags,
        site_info_serial,
        recursion_count,
        expiration,
        session_id: envelope.session_id,
        request_id: envelope.request_id,
        body,
        request_digest,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::MessageBuilder;

    fn envelope_for(message: &Message) -> Envelope {
        let mut env = Envelope::new(message.version, message.session_id, message.request_id);
        env.message_length = 0;
        env
    }

    fn roundtrip(message: Message) -> Message {
        let encoded = encode_message(&message);
        let decoded = decode_message(encoded.bytes(), &envelope_for(&message)).unwrap();
        assert_eq!(decoded, message);
        decoded
    }

    #[test]
    fn resolution_request_roundtrip() {
        let message = MessageBuilder::request(MessageBody::Resolution {
            handle: "100/test".into(),
            types: vec![b"URL".to_vec(), b"EMAIL".to_vec()],
            indexes: vec![1, 3],
        })
        .request_id(17)
        .build();
        roundtrip(message);
    }

    #[test]
    fn handle_value_codec_matches_storage_size() {
        let mut value = HandleValue::new(2, b"URL".to_vec(), b"https://example.org/x".to_vec());
        value.references.push(ValueReference::new(b"0.NA/10".to_vec(), 300));
        value.references.push(ValueReference::new(b"".to_vec(), 0));
        let mut buf = Vec::new();
        encode_handle_value(&mut buf, &value);
        assert_eq!(buf.len(), value.storage_size());
        let decoded = decode_handle_value(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn admin_record_codec_matches_storage_size() {
        let record = AdminRecord::new(AdminPermissions::all(), b"0.NA/10".to_vec(), 200);
        let bytes = admin_record_to_bytes(&record);
        assert_eq!(bytes.len(), record.storage_size());
        assert_eq!(admin_record_from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn site_info_roundtrip() {
        let mut site = SiteInfo::single_server(
            "2001:db8::1".parse().unwrap(),
            vec![Interface {
                service_type: crate::types::site::SERVICE_QUERY,
                protocol: InterfaceProtocol::Udp,
                port: 2641,
            }],
        );
        site.attributes.push(Attribute {
            name: b"domain".to_vec(),
            value: b"hdl.example.org".to_vec(),
        });
        site.hash_filter = b"filter".to_vec();
        let bytes = site_info_to_bytes(&site);
        assert_eq!(site_info_from_bytes(&bytes).unwrap(), site);
    }

    #[test]
    fn error_response_roundtrip_and_legacy_empty_body() {
        let request = MessageBuilder::request(MessageBody::Resolution {
            handle: "100/x".into(),
            types: vec![],
            indexes: vec![],
        })
        .build();
        let error = MessageBuilder::response(
            &request,
            ResponseCode::HandleNotFound,
            MessageBody::Error {
                message: b"not found".to_vec(),
                indexes: vec![4],
            },
        )
        .build();
        roundtrip(error);

        // Empty error body from a 2.0-era server decodes, not errors.
        let mut legacy = MessageBuilder::response(
            &request,
            ResponseCode::Error,
            MessageBody::Error {
                message: Vec::new(),
                indexes: Vec::new(),
            },
        )
        .version(ProtocolVersion::new(5, 0))
        .build();
        legacy.suggested_version = ProtocolVersion::new(5, 0);
        let mut encoded = encode_message(&legacy).bytes().to_vec();
        encoded.truncate(HEADER_LENGTH);
        // Patch body length to zero to simulate the truncated legacy body.
        encoded[20..24].copy_from_slice(&0u32.to_be_bytes());
        let decoded = decode_message(&encoded, &envelope_for(&legacy)).unwrap();
        assert_eq!(
            decoded.body,
            MessageBody::Error {
                message: Vec::new(),
                indexes: Vec::new()
            }
        );

        // The same truncated body from a modern server is a hard error.
        let mut modern_env = envelope_for(&legacy);
        modern_env.version = ProtocolVersion::new(2, 11);
        assert!(decode_message(&encoded, &modern_env).is_err());
    }

    #[test]
    fn unknown_opcode_is_protocol_error() {
        let message = MessageBuilder::request(MessageBody::GetSiteInfo).build();
        let mut bytes = encode_message(&message).bytes().to_vec();
        bytes[0..4].copy_from_slice(&9999u32.to_be_bytes());
        assert!(matches!(
            decode_message(&bytes, &envelope_for(&message)),
            Err(HandleError::UnknownMessageKind { op_code: 9999, .. })
        ));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let message = MessageBuilder::request(MessageBody::GetSiteInfo).build();
        let mut bytes = encode_message(&message).bytes().to_vec();
        // Extend the body without fixing up lengths.
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(decode_message(&bytes, &envelope_for(&message)).is_err());
    }

    #[test]
    fn signature_block_roundtrip() {
        let message = MessageBuilder::request(MessageBody::SessionTerminate)
            .session(9)
            .request_id(4)
            .signature(SignatureBlock {
                algorithm: b"HS256".to_vec(),
                signer_handle: String::new(),
                signer_index: 0,
                session_counter: 12,
                signature: vec![0xAB; 32],
            })
            .build();
        let decoded = roundtrip(message);
        assert_eq!(decoded.signature.unwrap().session_counter, 12);
    }

    #[test]
    fn referral_roundtrip() {
        let request = MessageBuilder::request(MessageBody::Resolution {
            handle: "10.5000/abc".into(),
            types: vec![],
            indexes: vec![],
        })
        .build();
        let referral = MessageBuilder::response(
            &request,
            ResponseCode::ServiceReferral,
            MessageBody::Referral {
                referral_handle: "0.NA/10.5000".into(),
                sites: vec![SiteInfo::single_server(
                    "192.0.2.7".parse().unwrap(),
                    vec![],
                )],
            },
        )
        .build();
        roundtrip(referral);
    }
}
