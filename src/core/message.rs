//! Message model: protocol versions, opcodes, response codes, option flags,
//! and the tagged union of message bodies.
//!
//! A [`Message`] is constructed through [`MessageBuilder`] and treated as
//! immutable once built; anything that needs a changed field (a racer
//! re-assigning a request id, a retry re-signing) builds a new value instead
//! of mutating and invalidating cached encodings.

use serde::{Deserialize, Serialize};

use crate::types::{HandleValue, SiteInfo};

/// Protocol version spoken by this client.
pub const CLIENT_VERSION: ProtocolVersion = ProtocolVersion { major: 2, minor: 11 };

/// Negotiated protocol version of a message or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// The version used for feature gating.
    ///
    /// Historical quirk: some very old clients reported their software major
    /// version 5; those speak the earliest 2.x wire dialect and are treated
    /// as 2.0 everywhere a version gate is consulted.
    pub fn effective(self) -> Self {
        if self.major == 5 {
            ProtocolVersion::new(2, 0)
        } else {
            self
        }
    }

    pub fn at_least(self, major: u8, minor: u8) -> bool {
        let v = self.effective();
        (v.major, v.minor) >= (major, minor)
    }

    pub fn before(self, major: u8, minor: u8) -> bool {
        !self.at_least(major, minor)
    }
}

/// Operation codes, wire values fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpCode {
    Resolution,
    GetSiteInfo,
    CreateHandle,
    DeleteHandle,
    AddValues,
    RemoveValues,
    ModifyValues,
    ListHandles,
    ListPrefixes,
    ChallengeAnswer,
    VerifyChallenge,
    SessionSetup,
    SessionTerminate,
    SessionExchangeKey,
}

impl OpCode {
    pub fn to_wire(self) -> u32 {
        match self {
            OpCode::Resolution => 1,
            OpCode::GetSiteInfo => 2,
            OpCode::CreateHandle => 100,
            OpCode::DeleteHandle => 101,
            OpCode::AddValues => 102,
            OpCode::RemoveValues => 103,
            OpCode::ModifyValues => 104,
            OpCode::ListHandles => 105,
            OpCode::ListPrefixes => 106,
            OpCode::ChallengeAnswer => 200,
            OpCode::VerifyChallenge => 201,
            OpCode::SessionSetup => 400,
            OpCode::SessionTerminate => 401,
            OpCode::SessionExchangeKey => 402,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(OpCode::Resolution),
            2 => Some(OpCode::GetSiteInfo),
            100 => Some(OpCode::CreateHandle),
            101 => Some(OpCode::DeleteHandle),
            102 => Some(OpCode::AddValues),
            103 => Some(OpCode::RemoveValues),
            104 => Some(OpCode::ModifyValues),
            105 => Some(OpCode::ListHandles),
            106 => Some(OpCode::ListPrefixes),
            200 => Some(OpCode::ChallengeAnswer),
            201 => Some(OpCode::VerifyChallenge),
            400 => Some(OpCode::SessionSetup),
            401 => Some(OpCode::SessionTerminate),
            402 => Some(OpCode::SessionExchangeKey),
            _ => None,
        }
    }

    /// Whether this operation mutates handle data (and therefore requires a
    /// primary site and invalidates cache entries before hitting the wire).
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            OpCode::CreateHandle
                | OpCode::DeleteHandle
                | OpCode::AddValues
                | OpCode::RemoveValues
                | OpCode::ModifyValues
        )
    }
}

/// Response codes. `Request` (0) marks a request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseCode {
    Request,
    Success,
    Error,
    ServerBusy,
    ProtocolError,
    OperationDenied,
    RecursionLimit,
    HandleNotFound,
    HandleAlreadyExists,
    InvalidHandle,
    ValuesNotFound,
    ValueAlreadyExists,
    InvalidValue,
    OutOfDateSiteInfo,
    ServiceReferral,
    PrefixReferral,
    AuthenticationNeeded,
    AuthenticationFailed,
    InvalidCredential,
    AuthenticationTimedOut,
    SessionTimeout,
    SessionFailed,
    InvalidSessionKey,
    SessionMessageRejected,
}

impl ResponseCode {
    pub fn to_wire(self) -> u32 {
        match self {
            ResponseCode::Request => 0,
            ResponseCode::Success => 1,
            ResponseCode::Error => 2,
            ResponseCode::ServerBusy => 3,
            ResponseCode::ProtocolError => 4,
            ResponseCode::OperationDenied => 5,
            ResponseCode::RecursionLimit => 6,
            ResponseCode::HandleNotFound => 100,
            ResponseCode::HandleAlreadyExists => 101,
            ResponseCode::InvalidHandle => 102,
            ResponseCode::ValuesNotFound => 200,
            ResponseCode::ValueAlreadyExists => 201,
            ResponseCode::InvalidValue => 202,
            ResponseCode::OutOfDateSiteInfo => 300,
            ResponseCode::ServiceReferral => 302,
            ResponseCode::PrefixReferral => 303,
            ResponseCode::AuthenticationNeeded => 402,
            ResponseCode::AuthenticationFailed => 403,
            ResponseCode::InvalidCredential => 404,
            ResponseCode::AuthenticationTimedOut => 405,
            ResponseCode::SessionTimeout => 500,
            ResponseCode::SessionFailed => 501,
            ResponseCode::InvalidSessionKey => 502,
            ResponseCode::SessionMessageRejected => 505,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(ResponseCode::Request),
            1 => Some(ResponseCode::Success),
            2 => Some(ResponseCode::Error),
            3 => Some(ResponseCode::ServerBusy),
            4 => Some(ResponseCode::ProtocolError),
            5 => Some(ResponseCode::OperationDenied),
            6 => Some(ResponseCode::RecursionLimit),
            100 => Some(ResponseCode::HandleNotFound),
            101 => Some(ResponseCode::HandleAlreadyExists),
            102 => Some(ResponseCode::InvalidHandle),
            200 => Some(ResponseCode::ValuesNotFound),
            201 => Some(ResponseCode::ValueAlreadyExists),
            202 => Some(ResponseCode::InvalidValue),
            300 => Some(ResponseCode::OutOfDateSiteInfo),
            302 => Some(ResponseCode::ServiceReferral),
            303 => Some(ResponseCode::PrefixReferral),
            402 => Some(ResponseCode::AuthenticationNeeded),
            403 => Some(ResponseCode::AuthenticationFailed),
            404 => Some(ResponseCode::InvalidCredential),
            405 => Some(ResponseCode::AuthenticationTimedOut),
            500 => Some(ResponseCode::SessionTimeout),
            501 => Some(ResponseCode::SessionFailed),
            502 => Some(ResponseCode::InvalidSessionKey),
            505 => Some(ResponseCode::SessionMessageRejected),
            _ => None,
        }
    }

    /// Error-family codes that share the cross-opcode error body decoder.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            ResponseCode::Request
                | ResponseCode::Success
                | ResponseCode::ServiceReferral
                | ResponseCode::PrefixReferral
                | ResponseCode::AuthenticationNeeded
        )
    }

    pub fn is_referral(self) -> bool {
        matches!(
            self,
            ResponseCode::ServiceReferral | ResponseCode::PrefixReferral
        )
    }

    /// Session-layer failures that trigger teardown and one repair attempt.
    pub fn is_session_failure(self) -> bool {
        matches!(
            self,
            ResponseCode::SessionTimeout
                | ResponseCode::SessionFailed
                | ResponseCode::InvalidSessionKey
                | ResponseCode::SessionMessageRejected
        )
    }
}

/// Boolean option flags carried in the header's flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpFlags {
    /// Response must come from (and be signed by) an authoritative server.
    pub authoritative: bool,
    /// Response must be certified (signed).
    pub certify: bool,
    /// Encrypt the body with the session key.
    pub encrypt: bool,
    /// Server may recurse on the client's behalf.
    pub recursive: bool,
    /// Caching resolvers must certify cached responses.
    pub cache_certify: bool,
    /// More-to-come streaming response.
    pub continuous: bool,
    /// Keep the connection alive after this exchange.
    pub keep_alive: bool,
    /// Restrict the response to publicly readable values.
    pub public_only: bool,
    /// Response must carry a digest of the request.
    pub return_request_digest: bool,
    /// Overwrite existing values on create.
    pub overwrite: bool,
    /// Server mints a new suffix on create.
    pub mint_new_suffix: bool,
    /// Server must answer itself rather than refer.
    pub do_not_refer: bool,
}

const FLAG_AUTH: u32 = 0x8000_0000;
const FLAG_CERT: u32 = 0x4000_0000;
const FLAG_ENCR: u32 = 0x2000_0000;
const FLAG_RECU: u32 = 0x1000_0000;
const FLAG_CACR: u32 = 0x0800_0000;
const FLAG_CONT: u32 = 0x0400_0000;
const FLAG_KPAL: u32 = 0x0200_0000;
const FLAG_PUBL: u32 = 0x0100_0000;
const FLAG_RRDG: u32 = 0x0080_0000;
const FLAG_OVRW: u32 = 0x0040_0000;
const FLAG_MINT: u32 = 0x0020_0000;
const FLAG_DNRF: u32 = 0x0010_0000;

impl OpFlags {
    pub fn to_wire(self) -> u32 {
        let mut bits = 0;
        let mut set = |flag: bool, bit: u32| {
            if flag {
                bits |= bit;
            }
        };
        set(self.authoritative, FLAG_AUTH);
        set(self.certify, FLAG_CERT);
        set(self.encrypt, FLAG_ENCR);
        set(self.recursive, FLAG_RECU);
        set(self.cache_certify, FLAG_CACR);
        set(self.continuous, FLAG_CONT);
        set(self.keep_alive, FLAG_KPAL);
        set(self.public_only, FLAG_PUBL);
        set(self.return_request_digest, FLAG_RRDG);
        set(self.overwrite, FLAG_OVRW);
        set(self.mint_new_suffix, FLAG_MINT);
        set(self.do_not_refer, FLAG_DNRF);
        bits
    }

    pub fn from_wire(bits: u32) -> Self {
        Self {
            authoritative: bits & FLAG_AUTH != 0,
            certify: bits & FLAG_CERT != 0,
            encrypt: bits & FLAG_ENCR != 0,
            recursive: bits & FLAG_RECU != 0,
            cache_certify: bits & FLAG_CACR != 0,
            continuous: bits & FLAG_CONT != 0,
            keep_alive: bits & FLAG_KPAL != 0,
            public_only: bits & FLAG_PUBL != 0,
            return_request_digest: bits & FLAG_RRDG != 0,
            overwrite: bits & FLAG_OVRW != 0,
            mint_new_suffix: bits & FLAG_MINT != 0,
            do_not_refer: bits & FLAG_DNRF != 0,
        }
    }
}

/// How a session-setup response conveys key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKeyMode {
    /// Server sent its public key; client must follow up with an explicit
    /// key-exchange message carrying the sealed session key.
    ServerPublicKey,
    /// Server completed a Diffie-Hellman derivation; `data` is its ephemeral
    /// public key.
    DiffieHellman,
}

impl SessionKeyMode {
    pub fn to_wire(self) -> u8 {
        match self {
            SessionKeyMode::ServerPublicKey => 1,
            SessionKeyMode::DiffieHellman => 2,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(SessionKeyMode::ServerPublicKey),
            2 => Some(SessionKeyMode::DiffieHellman),
            _ => None,
        }
    }
}

/// The tagged union of all message payloads, keyed on the wire by
/// `(response_code, op_code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageBody {
    // Requests.
    Resolution {
        handle: String,
        types: Vec<Vec<u8>>,
        indexes: Vec<u32>,
    },
    GetSiteInfo,
    CreateHandle {
        handle: String,
        values: Vec<HandleValue>,
    },
    DeleteHandle {
        handle: String,
    },
    AddValues {
        handle: String,
        values: Vec<HandleValue>,
    },
    RemoveValues {
        handle: String,
        indexes: Vec<u32>,
    },
    ModifyValues {
        handle: String,
        values: Vec<HandleValue>,
    },
    ListHandles {
        prefix_handle: String,
    },
    ListPrefixes {
        prefix_handle: String,
    },
    ChallengeAnswer {
        auth_type: Vec<u8>,
        user_handle: String,
        user_index: u32,
        answer: Vec<u8>,
    },
    VerifyChallenge {
        user_handle: String,
        user_index: u32,
        nonce: Vec<u8>,
        original_digest: Vec<u8>,
        answer: Vec<u8>,
    },
    SessionSetup {
        timeout_seconds: u32,
        /// Client x25519 public key, empty when the client wants the server
        /// to offer its own key instead.
        exchange_public_key: Vec<u8>,
    },
    SessionExchangeKey {
        algorithm: Vec<u8>,
        ephemeral_public_key: Vec<u8>,
        nonce: Vec<u8>,
        sealed_key: Vec<u8>,
    },
    SessionTerminate,

    // Responses.
    ResolutionResponse {
        handle: String,
        values: Vec<HandleValue>,
    },
    GetSiteInfoResponse {
        site: SiteInfo,
    },
    CreateHandleResponse {
        /// Present when the server minted a new suffix.
        minted_handle: Option<String>,
    },
    ListHandlesResponse {
        handles: Vec<String>,
    },
    ListPrefixesResponse {
        prefixes: Vec<String>,
    },
    VerifyChallengeResponse {
        verified: bool,
    },
    SessionSetupResponse {
        mode: SessionKeyMode,
        /// Negotiated symmetric algorithm name; empty for versions that
        /// assume the fixed legacy algorithm.
        algorithm: Vec<u8>,
        data: Vec<u8>,
    },
    /// Server challenge demanding authentication (cross-opcode).
    Challenge {
        nonce: Vec<u8>,
        request_digest: Vec<u8>,
    },
    /// Error body shared by every error-family response code (cross-opcode).
    Error {
        message: Vec<u8>,
        indexes: Vec<u32>,
    },
    /// Referral body shared by service and prefix referrals (cross-opcode).
    Referral {
        referral_handle: String,
        sites: Vec<SiteInfo>,
    },
    /// Empty-body success for mutating and session operations.
    Success,
}

impl MessageBody {
    /// The opcode a request body travels under. Response bodies reuse the
    /// opcode of the request they answer, so they have no opcode of their
    /// own.
    pub fn request_op_code(&self) -> Option<OpCode> {
        match self {
            MessageBody::Resolution { .. } => Some(OpCode::Resolution),
            MessageBody::GetSiteInfo => Some(OpCode::GetSiteInfo),
            MessageBody::CreateHandle { .. } => Some(OpCode::CreateHandle),
            MessageBody::DeleteHandle { .. } => Some(OpCode::DeleteHandle),
            MessageBody::AddValues { .. } => Some(OpCode::AddValues),
            MessageBody::RemoveValues { .. } => Some(OpCode::RemoveValues),
            MessageBody::ModifyValues { .. } => Some(OpCode::ModifyValues),
            MessageBody::ListHandles { .. } => Some(OpCode::ListHandles),
            MessageBody::ListPrefixes { .. } => Some(OpCode::ListPrefixes),
            MessageBody::ChallengeAnswer { .. } => Some(OpCode::ChallengeAnswer),
            MessageBody::VerifyChallenge { .. } => Some(OpCode::VerifyChallenge),
            MessageBody::SessionSetup { .. } => Some(OpCode::SessionSetup),
            MessageBody::SessionExchangeKey { .. } => Some(OpCode::SessionExchangeKey),
            MessageBody::SessionTerminate => Some(OpCode::SessionTerminate),
            _ => None,
        }
    }
}

/// Digest algorithm identifiers used in signature and request-digest blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn to_wire(self) -> u8 {
        match self {
            DigestAlgorithm::Sha1 => 1,
            DigestAlgorithm::Sha256 => 2,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(DigestAlgorithm::Sha1),
            2 => Some(DigestAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Digest of the request bytes echoed in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDigest {
    pub algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
}

/// Trailing signature block: MAC or asymmetric signature plus the metadata a
/// verifier needs to select the matching algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
    /// Algorithm identifier, e.g. `HS256`, `HS1`, `SHA1`, `ED25519`.
    pub algorithm: Vec<u8>,
    /// Identity of an asymmetric signer; empty handle for session MACs.
    pub signer_handle: String,
    pub signer_index: u32,
    /// Session counter covered by a MAC; 0 for asymmetric signatures.
    pub session_counter: u32,
    pub signature: Vec<u8>,
}

/// One protocol message: header fields, body, and trailing security blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub version: ProtocolVersion,
    /// Highest version the sender would prefer to speak.
    pub suggested_version: ProtocolVersion,
    pub op_code: OpCode,
    pub response_code: ResponseCode,
    pub flags: OpFlags,
    pub site_info_serial: u16,
    pub recursion_count: u8,
    /// Epoch seconds after which the message is invalid.
    pub expiration: u32,
    pub session_id: u32,
    pub request_id: u32,
    pub body: MessageBody,
    pub request_digest: Option<RequestDigest>,
    pub signature: Option<SignatureBlock>,
}

impl Message {
    pub fn is_request(&self) -> bool {
        self.response_code == ResponseCode::Request
    }

    /// Responses older than `now` (epoch seconds) are rejected.
    pub fn is_expired(&self, now: u32) -> bool {
        self.expiration != 0 && self.expiration < now
    }

    pub fn is_certified(&self) -> bool {
        self.signature.is_some()
    }
}

/// Builder producing an immutable [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Start a request for the given body. The opcode is derived from the
    /// body; response bodies need [`MessageBuilder::response`].
    pub fn request(body: MessageBody) -> Self {
        let op_code = body.request_op_code().unwrap_or(OpCode::Resolution);
        Self {
            message: Message {
                version: CLIENT_VERSION,
                suggested_version: CLIENT_VERSION,
                op_code,
                response_code: ResponseCode::Request,
                flags: OpFlags::default(),
                site_info_serial: 0,
                recursion_count: 0,
                expiration: 0,
                session_id: 0,
                request_id: 0,
                body,
                request_digest: None,
                signature: None,
            },
        }
    }

    /// Start a response to `request` with the given code and body.
    pub fn response(request: &Message, code: ResponseCode, body: MessageBody) -> Self {
        Self {
            message: Message {
                version: request.version,
                suggested_version: CLIENT_VERSION,
                op_code: request.op_code,
                response_code: code,
                flags: OpFlags::default(),
                site_info_serial: request.site_info_serial,
                recursion_count: request.recursion_count,
                expiration: request.expiration,
                session_id: request.session_id,
                request_id: request.request_id,
                body,
                request_digest: None,
                signature: None,
            },
        }
    }

    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.message.version = version;
        self
    }

    pub fn flags(mut self, flags: OpFlags) -> Self {
        self.message.flags = flags;
        self
    }

    pub fn session(mut self, session_id: u32) -> Self {
        self.message.session_id = session_id;
        self
    }

    pub fn request_id(mut self, request_id: u32) -> Self {
        self.message.request_id = request_id;
        self
    }

    pub fn recursion_count(mut self, count: u8) -> Self {
        self.message.recursion_count = count;
        self
    }

    pub fn site_info_serial(mut self, serial: u16) -> Self {
        self.message.site_info_serial = serial;
        self
    }

    pub fn expires_at(mut self, epoch_seconds: u32) -> Self {
        self.message.expiration = epoch_seconds;
        self
    }

    pub fn request_digest(mut self, digest: RequestDigest) -> Self {
        self.message.request_digest = Some(digest);
        self
    }

    pub fn signature(mut self, signature: SignatureBlock) -> Self {
        self.message.signature = Some(signature);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
