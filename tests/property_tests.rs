#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for the wire layer.
//!
//! These pin the invariants the rest of the client leans on: declared
//! storage sizes match what the codec emits, round-trips are lossless, and
//! server selection is stable.

use proptest::prelude::*;

use handle_protocol::core::codec::{
    admin_record_from_bytes, admin_record_to_bytes, decode_handle_value, decode_message,
    encode_handle_value, encode_message,
};
use handle_protocol::core::envelope::Envelope;
use handle_protocol::core::message::{MessageBody, MessageBuilder, ProtocolVersion};
use handle_protocol::core::wire::Reader;
use handle_protocol::types::site::{HashOption, ServerInfo, SiteInfo};
use handle_protocol::types::{
    AdminPermissions, AdminRecord, HandleValue, ValueReference,
};

fn arb_reference() -> impl Strategy<Value = ValueReference> {
    ("[a-zA-Z0-9./]{1,32}", any::<u32>())
        .prop_map(|(handle, index)| ValueReference::new(handle.into_bytes(), index))
}

fn arb_value() -> impl Strategy<Value = HandleValue> {
    (
        any::<u32>(),
        prop::collection::vec(any::<u8>(), 0..24),
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(arb_reference(), 0..4),
    )
        .prop_map(|(index, value_type, data, references)| {
            let mut value = HandleValue::new(index, value_type, data);
            value.references = references;
            value
        })
}

// Property: a value's declared storage size equals its encoded length, and
// the encoding round-trips.
proptest! {
    #[test]
    fn prop_handle_value_storage_size_is_exact(value in arb_value()) {
        let mut buf: Vec<u8> = Vec::new();
        encode_handle_value(&mut buf, &value);
        prop_assert_eq!(buf.len(), value.storage_size());

        let decoded = decode_handle_value(&mut Reader::new(&buf)).unwrap();
        prop_assert_eq!(decoded, value);
    }
}

// Property: admin records round-trip and declare their size exactly.
proptest! {
    #[test]
    fn prop_admin_record_storage_size_is_exact(
        bits in 0u16..=0x0FFF,
        handle in "[a-zA-Z0-9./]{1,64}",
        index in any::<u32>(),
    ) {
        let record = AdminRecord::new(AdminPermissions(bits), handle.into_bytes(), index);
        let bytes = admin_record_to_bytes(&record);
        prop_assert_eq!(bytes.len(), record.storage_size());
        prop_assert_eq!(admin_record_from_bytes(&bytes).unwrap(), record);
    }
}

// Property: the envelope encodes to exactly 20 bytes and round-trips.
proptest! {
    #[test]
    fn prop_envelope_roundtrip(
        major in 0u8..10,
        minor in 0u8..16,
        session_id in any::<u32>(),
        request_id in any::<u32>(),
        sequence in 0u32..1024,
        length in 0u32..1_000_000,
        truncated in any::<bool>(),
    ) {
        let mut env = Envelope::new(ProtocolVersion::new(major, minor), session_id, request_id);
        env.sequence_number = sequence;
        env.message_length = length;
        env.truncated = truncated;
        let bytes = env.encode();
        prop_assert_eq!(bytes.len(), 20);
        prop_assert_eq!(Envelope::decode(&bytes).unwrap(), env);
    }
}

// Property: resolution requests round-trip through the full message codec
// for arbitrary handles and filters.
proptest! {
    #[test]
    fn prop_resolution_request_roundtrip(
        handle in "[a-zA-Z0-9.]{1,16}/[a-zA-Z0-9._-]{1,48}",
        types in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..16), 0..4),
        indexes in prop::collection::vec(any::<u32>(), 0..8),
        request_id in 1u32..0x00FF_FFFF,
    ) {
        let message = MessageBuilder::request(MessageBody::Resolution {
            handle,
            types,
            indexes,
        })
        .request_id(request_id)
        .build();
        let encoded = encode_message(&message);
        let envelope = Envelope::new(message.version, 0, request_id);
        let decoded = decode_message(encoded.bytes(), &envelope).unwrap();
        prop_assert_eq!(decoded, message);
    }
}

// Property: encoding is deterministic.
proptest! {
    #[test]
    fn prop_encoding_deterministic(
        handle in "[a-zA-Z0-9.]{1,16}/[a-zA-Z0-9._-]{1,32}",
        data in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let message = MessageBuilder::request(MessageBody::AddValues {
            handle,
            values: vec![HandleValue::new(1, b"URL".to_vec(), data)],
        })
        .request_id(9)
        .build();
        let first = encode_message(&message);
        let second = encode_message(&message);
        prop_assert_eq!(first.bytes(), second.bytes());
    }
}

// Property: server selection always lands inside the server list and does
// not depend on prefix case.
proptest! {
    #[test]
    fn prop_sharding_in_bounds_and_case_stable(
        prefix in "[a-zA-Z0-9.]{1,16}",
        suffix in "[a-zA-Z0-9._-]{1,32}",
        servers in 1usize..32,
    ) {
        let mut site = SiteInfo::single_server("127.0.0.1".parse().unwrap(), vec![]);
        site.hash_option = HashOption::ByPrefix;
        site.servers = (0..servers)
            .map(|i| ServerInfo {
                server_id: i as u32,
                address: ServerInfo::pack_address("127.0.0.1".parse().unwrap()),
                public_key: Vec::new(),
                interfaces: Vec::new(),
            })
            .collect();

        let lower = format!("{}/{}", prefix.to_ascii_lowercase(), suffix);
        let upper = format!("{}/{}", prefix.to_ascii_uppercase(), suffix);
        let chosen = site.determine_server_num(&lower);
        prop_assert!(chosen < servers);
        prop_assert_eq!(site.determine_server_num(&upper), chosen);
    }
}

// Property: random bytes never panic the decoder; they decode or error.
proptest! {
    #[test]
    fn prop_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
        let envelope = Envelope::new(ProtocolVersion::new(2, 11), 0, 1);
        let _ = decode_message(&bytes, &envelope);
    }
}
