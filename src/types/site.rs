//! Site and server topology records.
//!
//! A [`SiteInfo`] describes one deployment of a handle service: protocol
//! version, primary flags, how handles are sharded across its servers, a set
//! of free-form attributes (domain names, HTTP paths, alternate addresses),
//! and the servers themselves with their interfaces.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::handle::{prefix_of, suffix_of};

/// Attribute name carrying a DNS name for servers with all-zero addresses.
pub const ATTR_DOMAIN: &str = "domain";
/// Attribute name carrying the URI path prefix for HTTP interfaces.
pub const ATTR_PATH: &str = "path";

/// Interface service-type bit: accepts administrative requests.
pub const SERVICE_ADMIN: u8 = 0x01;
/// Interface service-type bit: accepts resolution requests.
pub const SERVICE_QUERY: u8 = 0x02;

/// Site flag bit: this site is a primary.
pub const SITE_FLAG_PRIMARY: u8 = 0x40;
/// Site flag bit: the service has multiple primaries.
pub const SITE_FLAG_MULTI_PRIMARY: u8 = 0x80;

/// How handles are distributed across a site's servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HashOption {
    /// Hash only the prefix part (case-insensitive).
    ByPrefix,
    /// Hash only the suffix part.
    BySuffix,
    /// Hash the whole handle string, prefix folded to upper case.
    ByWholeHandle,
}

impl HashOption {
    pub fn to_wire(self) -> u8 {
        match self {
            HashOption::ByPrefix => 0,
            HashOption::BySuffix => 1,
            HashOption::ByWholeHandle => 2,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(HashOption::ByPrefix),
            1 => Some(HashOption::BySuffix),
            2 => Some(HashOption::ByWholeHandle),
            _ => None,
        }
    }
}

/// Wire protocol spoken on one server interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterfaceProtocol {
    Udp,
    Tcp,
    Http,
    Https,
}

impl InterfaceProtocol {
    pub fn to_wire(self) -> u8 {
        match self {
            InterfaceProtocol::Udp => 0,
            InterfaceProtocol::Tcp => 1,
            InterfaceProtocol::Http => 2,
            InterfaceProtocol::Https => 3,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(InterfaceProtocol::Udp),
            1 => Some(InterfaceProtocol::Tcp),
            2 => Some(InterfaceProtocol::Http),
            3 => Some(InterfaceProtocol::Https),
            _ => None,
        }
    }
}

/// One listening endpoint of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// SERVICE_ADMIN / SERVICE_QUERY bits.
    pub service_type: u8,
    pub protocol: InterfaceProtocol,
    pub port: u32,
}

impl Interface {
    pub fn accepts_admin(&self) -> bool {
        self.service_type & SERVICE_ADMIN != 0
    }

    pub fn accepts_query(&self) -> bool {
        self.service_type & SERVICE_QUERY != 0
    }
}

/// Free-form (name, value) pair attached to a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

/// One server of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_id: u32,
    /// 16 bytes, native IPv6 or IPv4-mapped (`::ffff:a.b.c.d`).
    pub address: [u8; 16],
    pub public_key: Vec<u8>,
    pub interfaces: Vec<Interface>,
}

impl ServerInfo {
    /// The address as an `IpAddr`, collapsing IPv4-mapped forms to IPv4.
    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.address);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// All-zero addresses are placeholders resolved through the site's
    /// `domain` attribute.
    pub fn has_placeholder_address(&self) -> bool {
        self.address.iter().all(|b| *b == 0)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.ip_addr(), IpAddr::V6(_))
    }

    /// Build an IPv4-mapped 16-byte address from an `IpAddr`.
    pub fn pack_address(addr: IpAddr) -> [u8; 16] {
        match addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// Interface to use for the given protocol, honoring service-type bits.
    pub fn interface_for(&self, protocol: InterfaceProtocol, admin: bool) -> Option<&Interface> {
        self.interfaces.iter().find(|ifc| {
            ifc.protocol == protocol
                && if admin {
                    ifc.accepts_admin()
                } else {
                    ifc.accepts_query()
                }
        })
    }
}

/// One deployed instance of a handle service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteInfo {
    /// Version of the site record format itself.
    pub data_format_version: u16,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Serial number; a higher serial than the cached one means the client's
    /// root/site information is stale.
    pub serial: u16,
    pub is_primary: bool,
    pub multi_primary: bool,
    pub hash_option: HashOption,
    /// Optional filter narrowing which handles this site serves.
    pub hash_filter: Vec<u8>,
    pub attributes: Vec<Attribute>,
    pub servers: Vec<ServerInfo>,
}

impl SiteInfo {
    /// Look up a site attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.name == name.as_bytes())
            .map(|a| a.value.as_slice())
    }

    /// Select which server of this site is responsible for `handle`.
    ///
    /// The relevant handle part is digested with SHA-256 and the last four
    /// bytes taken modulo the server count. Prefix hashing folds case so that
    /// `0.NA/Test` and `0.NA/TEST` land on the same server.
    pub fn determine_server_num(&self, handle: &str) -> usize {
        if self.servers.len() <= 1 {
            return 0;
        }
        let part = match self.hash_option {
            HashOption::ByPrefix => prefix_of(handle).to_ascii_uppercase(),
            HashOption::BySuffix => suffix_of(handle).to_string(),
            HashOption::ByWholeHandle => {
                let mut whole = prefix_of(handle).to_ascii_uppercase();
                let suffix = suffix_of(handle);
                if !suffix.is_empty() {
                    whole.push('/');
                    whole.push_str(suffix);
                }
                whole
            }
        };
        let digest = Sha256::digest(part.as_bytes());
        let tail: [u8; 4] = digest[28..32].try_into().unwrap_or([0; 4]);
        u32::from_be_bytes(tail) as usize % self.servers.len()
    }

    /// The server responsible for `handle`.
    pub fn server_for(&self, handle: &str) -> Option<&ServerInfo> {
        self.servers.get(self.determine_server_num(handle))
    }

    /// Flags byte as stored on the wire.
    pub fn flags_byte(&self) -> u8 {
        let mut flags = 0;
        if self.is_primary {
            flags |= SITE_FLAG_PRIMARY;
        }
        if self.multi_primary {
            flags |= SITE_FLAG_MULTI_PRIMARY;
        }
        flags
    }

    /// A minimal single-server site, used by bootstrap configuration.
    pub fn single_server(addr: IpAddr, interfaces: Vec<Interface>) -> Self {
        SiteInfo {
            data_format_version: 1,
            protocol_major: 2,
            protocol_minor: 11,
            serial: 1,
            is_primary: true,
            multi_primary: false,
            hash_option: HashOption::ByWholeHandle,
            hash_filter: Vec::new(),
            attributes: Vec::new(),
            servers: vec![ServerInfo {
                server_id: 1,
                address: ServerInfo::pack_address(addr),
                public_key: Vec::new(),
                interfaces,
            }],
        }
    }
}

/// Convenience for tests and bootstrap lists.
pub fn localhost_v4() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_with_servers(count: usize, hash_option: HashOption) -> SiteInfo {
        let mut site = SiteInfo::single_server(localhost_v4(), Vec::new());
        site.hash_option = hash_option;
        site.servers = (0..count)
            .map(|i| ServerInfo {
                server_id: i as u32,
                address: ServerInfo::pack_address(localhost_v4()),
                public_key: Vec::new(),
                interfaces: Vec::new(),
            })
            .collect();
        site
    }

    #[test]
    fn sharding_is_stable() {
        let site = site_with_servers(7, HashOption::ByWholeHandle);
        let first = site.determine_server_num("100/test");
        for _ in 0..10 {
            assert_eq!(site.determine_server_num("100/test"), first);
        }
    }

    #[test]
    fn sharding_prefix_case_insensitive() {
        let site = site_with_servers(7, HashOption::ByPrefix);
        assert_eq!(
            site.determine_server_num("abc.def/x"),
            site.determine_server_num("ABC.DEF/completely-different")
        );
        let whole = site_with_servers(7, HashOption::ByWholeHandle);
        assert_eq!(
            whole.determine_server_num("abc.def/x"),
            whole.determine_server_num("ABC.def/x")
        );
    }

    #[test]
    fn sharding_roughly_uniform() {
        let site = site_with_servers(4, HashOption::ByWholeHandle);
        let mut buckets = [0usize; 4];
        for i in 0..4000 {
            buckets[site.determine_server_num(&format!("300/item-{i}"))] += 1;
        }
        for bucket in buckets {
            // Expected 1000 per bucket; allow a generous band.
            assert!((700..=1300).contains(&bucket), "skewed bucket: {bucket}");
        }
    }

    #[test]
    fn ipv4_mapped_addresses_collapse() {
        let server = ServerInfo {
            server_id: 1,
            address: ServerInfo::pack_address("192.0.2.1".parse().unwrap()),
            public_key: Vec::new(),
            interfaces: Vec::new(),
        };
        assert_eq!(server.ip_addr(), "192.0.2.1".parse::<IpAddr>().unwrap());
        assert!(!server.is_ipv6());
    }

    #[test]
    fn placeholder_address_detection() {
        let server = ServerInfo {
            server_id: 1,
            address: [0; 16],
            public_key: Vec::new(),
            interfaces: Vec::new(),
        };
        assert!(server.has_placeholder_address());
    }
}
