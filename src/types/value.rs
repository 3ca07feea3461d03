//! Handle values and cross-references.
//!
//! A [`HandleValue`] is one attribute of an identifier: an index unique
//! within the handle (uniqueness is the caller's responsibility — the codec
//! does not enforce it), a type byte string, opaque data whose interpretation
//! depends on the type, a TTL, four independent permission bits, a timestamp,
//! and a list of non-owning references to values under other handles.

use serde::{Deserialize, Serialize};

/// Permission bit: value data readable by anyone.
pub const PERM_PUBLIC_READ: u8 = 0x01;
/// Permission bit: value data writable without admin rights.
pub const PERM_PUBLIC_WRITE: u8 = 0x02;
/// Permission bit: value data readable by handle administrators.
pub const PERM_ADMIN_READ: u8 = 0x04;
/// Permission bit: value data writable by handle administrators.
pub const PERM_ADMIN_WRITE: u8 = 0x08;
/// All currently valid permission bits.
pub const PERM_ALLOWED_MASK: u8 =
    PERM_PUBLIC_READ | PERM_PUBLIC_WRITE | PERM_ADMIN_READ | PERM_ADMIN_WRITE;

/// How the `ttl` field of a value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TtlType {
    /// `ttl` is a lifetime in seconds relative to retrieval time.
    Relative,
    /// `ttl` is an absolute expiration instant in epoch seconds.
    Absolute,
}

impl TtlType {
    pub fn to_wire(self) -> u8 {
        match self {
            TtlType::Relative => 0,
            TtlType::Absolute => 1,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TtlType::Relative),
            1 => Some(TtlType::Absolute),
            _ => None,
        }
    }
}

/// The four independent read/write permission bits of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuePermissions {
    pub public_read: bool,
    pub public_write: bool,
    pub admin_read: bool,
    pub admin_write: bool,
}

impl Default for ValuePermissions {
    /// Publicly readable, admin writable — the usual shape of resolution data.
    fn default() -> Self {
        Self {
            public_read: true,
            public_write: false,
            admin_read: true,
            admin_write: true,
        }
    }
}

impl ValuePermissions {
    pub fn to_wire(self) -> u8 {
        let mut bits = 0;
        if self.public_read {
            bits |= PERM_PUBLIC_READ;
        }
        if self.public_write {
            bits |= PERM_PUBLIC_WRITE;
        }
        if self.admin_read {
            bits |= PERM_ADMIN_READ;
        }
        if self.admin_write {
            bits |= PERM_ADMIN_WRITE;
        }
        bits
    }

    pub fn from_wire(bits: u8) -> Self {
        Self {
            public_read: bits & PERM_PUBLIC_READ != 0,
            public_write: bits & PERM_PUBLIC_WRITE != 0,
            admin_read: bits & PERM_ADMIN_READ != 0,
            admin_write: bits & PERM_ADMIN_WRITE != 0,
        }
    }
}

/// A non-owning pointer to a value stored under another handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueReference {
    pub handle: Vec<u8>,
    pub index: u32,
}

impl ValueReference {
    pub fn new(handle: impl Into<Vec<u8>>, index: u32) -> Self {
        Self {
            handle: handle.into(),
            index,
        }
    }

    /// Exact number of bytes the codec produces for this reference.
    pub fn storage_size(&self) -> usize {
        4 + self.handle.len() + 4
    }
}

/// One attribute of a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleValue {
    pub index: u32,
    pub value_type: Vec<u8>,
    pub data: Vec<u8>,
    pub ttl_type: TtlType,
    pub ttl: u32,
    pub permissions: ValuePermissions,
    pub timestamp: u32,
    pub references: Vec<ValueReference>,
}

impl HandleValue {
    /// A value with default TTL (24h relative), default permissions, and no
    /// references.
    pub fn new(index: u32, value_type: impl Into<Vec<u8>>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            value_type: value_type.into(),
            data: data.into(),
            ttl_type: TtlType::Relative,
            ttl: 86400,
            permissions: ValuePermissions::default(),
            timestamp: 0,
            references: Vec::new(),
        }
    }

    /// Whether the value's type matches one of the requested types.
    ///
    /// Type matching is case-insensitive and an empty request list matches
    /// everything.
    pub fn matches_types(&self, types: &[Vec<u8>]) -> bool {
        types.is_empty()
            || types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&self.value_type))
    }

    /// Whether the value's index matches one of the requested indexes; an
    /// empty request list matches everything.
    pub fn matches_indexes(&self, indexes: &[u32]) -> bool {
        indexes.is_empty() || indexes.contains(&self.index)
    }

    /// Exact number of bytes the codec produces for this value.
    ///
    /// Must stay in lockstep with `codec::encode_handle_value`; the codec's
    /// tests pin the two together. Layout:
    /// index(4) timestamp(4) ttlType(1) ttl(4) permissions(1)
    /// type(4+n) data(4+n) refs(4 + per-ref sizes).
    pub fn storage_size(&self) -> usize {
        let fixed = 4 + 4 + 1 + 4 + 1;
        let type_len = 4 + self.value_type.len();
        let data_len = 4 + self.data.len();
        let refs_len = 4 + self
            .references
            .iter()
            .map(ValueReference::storage_size)
            .sum::<usize>();
        fixed + type_len + data_len + refs_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_roundtrip() {
        for bits in 0..=PERM_ALLOWED_MASK {
            assert_eq!(ValuePermissions::from_wire(bits).to_wire(), bits);
        }
    }

    #[test]
    fn type_matching_is_case_insensitive() {
        let value = HandleValue::new(1, b"URL".to_vec(), b"https://example.org".to_vec());
        assert!(value.matches_types(&[b"url".to_vec()]));
        assert!(value.matches_types(&[]));
        assert!(!value.matches_types(&[b"EMAIL".to_vec()]));
    }

    #[test]
    fn storage_size_counts_references() {
        let mut value = HandleValue::new(100, b"HS_ADMIN".to_vec(), vec![0u8; 10]);
        let base = value.storage_size();
        value
            .references
            .push(ValueReference::new(b"0.NA/10".to_vec(), 300));
        assert_eq!(value.storage_size(), base + 4 + 7 + 4);
    }
}
