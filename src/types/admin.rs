//! Administrative permission records.
//!
//! An `HS_ADMIN` value's data is a 12-bit permission set plus the identity
//! (handle and value index) that holds those permissions over the handle.

use serde::{Deserialize, Serialize};

/// Bit positions of the twelve admin permissions, wire order.
pub const ADM_ADD_HANDLE: u16 = 0x0001;
pub const ADM_DELETE_HANDLE: u16 = 0x0002;
pub const ADM_ADD_DERIVED_PREFIX: u16 = 0x0004;
pub const ADM_DELETE_DERIVED_PREFIX: u16 = 0x0008;
pub const ADM_MODIFY_VALUE: u16 = 0x0010;
pub const ADM_REMOVE_VALUE: u16 = 0x0020;
pub const ADM_ADD_VALUE: u16 = 0x0040;
pub const ADM_MODIFY_ADMIN: u16 = 0x0080;
pub const ADM_REMOVE_ADMIN: u16 = 0x0100;
pub const ADM_ADD_ADMIN: u16 = 0x0200;
pub const ADM_READ_VALUE: u16 = 0x0400;
pub const ADM_LIST_HANDLES: u16 = 0x0800;

/// Mask of all defined admin permission bits.
pub const ADM_ALLOWED_MASK: u16 = 0x0FFF;

/// The 12-bit admin permission set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", transparent)]
pub struct AdminPermissions(pub u16);

impl AdminPermissions {
    /// Every permission granted.
    pub fn all() -> Self {
        Self(ADM_ALLOWED_MASK)
    }

    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    /// Whether any bits outside the defined twelve are set.
    pub fn has_unknown_bits(self) -> bool {
        self.0 & !ADM_ALLOWED_MASK != 0
    }
}

/// Owning identity plus permission set stored in an `HS_ADMIN` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRecord {
    pub permissions: AdminPermissions,
    pub admin_handle: Vec<u8>,
    pub admin_index: u32,
}

impl AdminRecord {
    pub fn new(permissions: AdminPermissions, admin_handle: impl Into<Vec<u8>>, admin_index: u32) -> Self {
        Self {
            permissions,
            admin_handle: admin_handle.into(),
            admin_index,
        }
    }

    /// Exact number of bytes the codec produces for this record.
    pub fn storage_size(&self) -> usize {
        2 + 4 + self.admin_handle.len() + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_queries() {
        let perms = AdminPermissions(ADM_ADD_VALUE | ADM_REMOVE_VALUE);
        assert!(perms.has(ADM_ADD_VALUE));
        assert!(!perms.has(ADM_DELETE_HANDLE));
        assert!(!perms.has_unknown_bits());
        assert!(AdminPermissions(0xF000).has_unknown_bits());
    }
}
