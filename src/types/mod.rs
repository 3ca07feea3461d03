//! # Protocol Data Types
//!
//! Plain data structures shared by the codec, the authentication layer, and
//! the resolution engine: handle string helpers, handle values, admin
//! permission records, and site/server topology.
//!
//! All record types derive `serde` with lower-camel-case field names so that
//! external tooling can serialize them to JSON without the core depending on
//! any particular serializer.

pub mod admin;
pub mod handle;
pub mod site;
pub mod value;

pub use admin::{AdminPermissions, AdminRecord};
pub use handle::{authority_handle, normalize_for_cache, prefix_of, GLOBAL_ROOT_PREFIX};
pub use site::{Attribute, HashOption, Interface, InterfaceProtocol, ServerInfo, SiteInfo};
pub use value::{HandleValue, TtlType, ValuePermissions, ValueReference};
