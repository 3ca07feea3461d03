//! # Configuration Management
//!
//! Centralized configuration for the handle protocol client: resolution
//! behavior, transport tuning, session policy, bootstrap trust material,
//! and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment variable overrides via `from_env()`

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{HandleError, Result};
use crate::types::site::{Interface, InterfaceProtocol, SERVICE_ADMIN, SERVICE_QUERY};
use crate::types::SiteInfo;

/// Default UDP port of a handle server.
pub const DEFAULT_UDP_PORT: u32 = 2641;
/// Default TCP port of a handle server.
pub const DEFAULT_TCP_PORT: u32 = 2641;
/// Default HTTP port of a handle server.
pub const DEFAULT_HTTP_PORT: u32 = 8000;

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    /// Resolution engine configuration
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Transport and racing configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Bootstrap trust material: root sites and pinned overrides
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HandleError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| HandleError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(roots) = std::env::var("HANDLE_CLIENT_ROOT_SERVERS") {
            config.bootstrap.root_servers =
                roots.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(timeout) = std::env::var("HANDLE_CLIENT_STREAM_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.transport.stream_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(limit) = std::env::var("HANDLE_CLIENT_RECURSION_LIMIT") {
            if let Ok(val) = limit.parse::<u8>() {
                config.resolution.recursion_limit = val;
            }
        }

        if let Ok(race) = std::env::var("HANDLE_CLIENT_DUAL_STACK_RACE") {
            config.transport.race_enabled = race != "0" && !race.eq_ignore_ascii_case("false");
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the
    /// configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.resolution.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.session.validate());
        errors.extend(self.bootstrap.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HandleError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Bootstrap root sites as site records.
    pub fn root_sites(&self) -> Result<Vec<SiteInfo>> {
        self.bootstrap
            .root_servers
            .iter()
            .map(|entry| parse_site_entry(entry))
            .collect()
    }

    /// Locally pinned site overrides, keyed by uppercased prefix.
    pub fn site_overrides(&self) -> Result<HashMap<String, Vec<SiteInfo>>> {
        let mut overrides: HashMap<String, Vec<SiteInfo>> = HashMap::new();
        for pin in &self.bootstrap.overrides {
            let site = parse_site_entry(&pin.server)?;
            overrides
                .entry(pin.prefix.to_ascii_uppercase())
                .or_default()
                .push(site);
        }
        Ok(overrides)
    }
}

/// Parse `"ip"` or `"ip:udp_port"` into a single-server site with the full
/// default interface set.
fn parse_site_entry(entry: &str) -> Result<SiteInfo> {
    let (addr_part, udp_port) = match entry.rsplit_once(':') {
        // An IPv6 literal has colons of its own; only treat the tail as a
        // port when it parses as one and the head parses as an address.
        Some((head, tail)) => match (head.parse::<IpAddr>(), tail.parse::<u32>()) {
            (Ok(addr), Ok(port)) => (addr, port),
            _ => (
                entry
                    .trim_matches(['[', ']'])
                    .parse::<IpAddr>()
                    .map_err(|_| {
                        HandleError::Config(format!("invalid server entry: {entry}"))
                    })?,
                DEFAULT_UDP_PORT,
            ),
        },
        None => (
            entry
                .parse::<IpAddr>()
                .map_err(|_| HandleError::Config(format!("invalid server entry: {entry}")))?,
            DEFAULT_UDP_PORT,
        ),
    };
    Ok(SiteInfo::single_server(
        addr_part,
        vec![
            Interface {
                service_type: SERVICE_QUERY | SERVICE_ADMIN,
                protocol: InterfaceProtocol::Udp,
                port: udp_port,
            },
            Interface {
                service_type: SERVICE_QUERY | SERVICE_ADMIN,
                protocol: InterfaceProtocol::Tcp,
                port: DEFAULT_TCP_PORT,
            },
            Interface {
                service_type: SERVICE_QUERY,
                protocol: InterfaceProtocol::Http,
                port: DEFAULT_HTTP_PORT,
            },
        ],
    ))
}

/// Resolution engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolutionConfig {
    /// Hard ceiling on referral/recursion depth
    pub recursion_limit: u8,

    /// Maximum cached (handle, filter) entries
    pub cache_capacity: usize,

    /// TTL for cached "handle not found" answers
    #[serde(with = "duration_serde")]
    pub negative_cache_ttl: Duration,

    /// Protocols in preference order, e.g. `["udp", "tcp", "http"]`
    pub protocol_preference: Vec<String>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 10,
            cache_capacity: 4096,
            negative_cache_ttl: Duration::from_secs(60),
            protocol_preference: vec![
                "udp".to_string(),
                "tcp".to_string(),
                "http".to_string(),
                "https".to_string(),
            ],
        }
    }
}

impl ResolutionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.recursion_limit == 0 {
            errors.push("resolution.recursion_limit must be at least 1".to_string());
        }
        if self.cache_capacity == 0 {
            errors.push("resolution.cache_capacity must be at least 1".to_string());
        }
        for name in &self.protocol_preference {
            if parse_protocol(name).is_none() {
                errors.push(format!("resolution.protocol_preference: unknown protocol {name}"));
            }
        }
        if self.protocol_preference.is_empty() {
            errors.push("resolution.protocol_preference must not be empty".to_string());
        }
        errors
    }

    /// Preference order as typed protocols, skipping unknown names.
    pub fn protocols(&self) -> Vec<InterfaceProtocol> {
        self.protocol_preference
            .iter()
            .filter_map(|name| parse_protocol(name))
            .collect()
    }
}

fn parse_protocol(name: &str) -> Option<InterfaceProtocol> {
    match name.to_ascii_lowercase().as_str() {
        "udp" => Some(InterfaceProtocol::Udp),
        "tcp" => Some(InterfaceProtocol::Tcp),
        "http" => Some(InterfaceProtocol::Http),
        "https" => Some(InterfaceProtocol::Https),
        _ => None,
    }
}

/// Transport and dual-stack racing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum UDP datagram payload after the envelope
    pub max_udp_payload: usize,

    /// Escalating per-attempt UDP timeouts, in milliseconds
    pub udp_retry_schedule_ms: Vec<u64>,

    /// Connect-and-read timeout for TCP and HTTP attempts
    #[serde(with = "duration_serde")]
    pub stream_timeout: Duration,

    /// Whether to race IPv6 against IPv4
    pub race_enabled: bool,

    /// Head start given to IPv6 before the IPv4 sequence begins
    #[serde(with = "duration_serde")]
    pub ipv4_handicap: Duration,

    pub ipv6_enabled: bool,
    pub ipv4_enabled: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_udp_payload: 1024,
            udp_retry_schedule_ms: vec![500, 1000, 1500],
            stream_timeout: Duration::from_secs(30),
            race_enabled: true,
            ipv4_handicap: Duration::from_millis(300),
            ipv6_enabled: true,
            ipv4_enabled: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_udp_payload < 64 {
            errors.push("transport.max_udp_payload must be at least 64 bytes".to_string());
        }
        if self.udp_retry_schedule_ms.is_empty() {
            errors.push("transport.udp_retry_schedule_ms must not be empty".to_string());
        }
        if self.stream_timeout.is_zero() {
            errors.push("transport.stream_timeout must be non-zero".to_string());
        }
        if !self.ipv4_enabled && !self.ipv6_enabled {
            errors.push("transport: at least one IP stack must be enabled".to_string());
        }
        errors
    }

    pub fn udp_retry_schedule(&self) -> Vec<Duration> {
        self.udp_retry_schedule_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Session lifetime requested from servers
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Maximum live sessions tracked at once
    pub max_sessions: usize,

    /// Open setup with a client Diffie-Hellman key instead of asking the
    /// server for its public key
    pub use_diffie_hellman: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            max_sessions: 64,
            use_diffie_hellman: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout.is_zero() {
            errors.push("session.timeout must be non-zero".to_string());
        }
        if self.max_sessions == 0 {
            errors.push("session.max_sessions must be at least 1".to_string());
        }
        errors
    }
}

/// One locally pinned site override for a prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrefixOverride {
    /// Prefix this override applies to, e.g. `10.5000`
    pub prefix: String,
    /// Server entry in `ip` or `ip:port` form
    pub server: String,
}

/// Bootstrap trust material
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapConfig {
    /// Global root service servers, `ip` or `ip:port` entries
    pub root_servers: Vec<String>,

    /// Locally pinned site overrides consulted before any discovery
    #[serde(default)]
    pub overrides: Vec<PrefixOverride>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            // Placeholder documentation addresses; deployments supply the
            // real root service here.
            root_servers: vec!["192.0.2.10".to_string(), "2001:db8::10".to_string()],
            overrides: Vec::new(),
        }
    }
}

impl BootstrapConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.root_servers.is_empty() {
            errors.push("bootstrap.root_servers must not be empty".to_string());
        }
        for entry in &self.root_servers {
            if parse_site_entry(entry).is_err() {
                errors.push(format!("bootstrap.root_servers: invalid entry {entry}"));
            }
        }
        for pin in &self.overrides {
            if pin.prefix.is_empty() {
                errors.push("bootstrap.overrides: empty prefix".to_string());
            }
            if parse_site_entry(&pin.server).is_err() {
                errors.push(format!("bootstrap.overrides: invalid server {}", pin.server));
            }
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(with = "log_level_serde")]
    pub level: Level,

    /// Whether to log in JSON format
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
        }
    }
}

/// Serialization helper for Duration fields (stored as milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serialization helper for tracing Level fields
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Level::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let config = ClientConfig::default_with_overrides(|c| {
            c.resolution.recursion_limit = 5;
            c.transport.race_enabled = false;
            c.bootstrap.overrides.push(PrefixOverride {
                prefix: "10.5000".to_string(),
                server: "192.0.2.50:2641".to_string(),
            });
        });
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed = ClientConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.resolution.recursion_limit, 5);
        assert!(!parsed.transport.race_enabled);
        assert_eq!(parsed.bootstrap.overrides.len(), 1);
    }

    #[test]
    fn invalid_values_are_reported() {
        let config = ClientConfig::default_with_overrides(|c| {
            c.resolution.recursion_limit = 0;
            c.transport.udp_retry_schedule_ms.clear();
            c.bootstrap.root_servers = vec!["not-an-address".to_string()];
        });
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn site_entries_parse_v4_and_v6() {
        let v4 = parse_site_entry("192.0.2.10:2641").unwrap();
        assert_eq!(v4.servers[0].ip_addr(), "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(v4.servers[0].interfaces[0].port, 2641);

        let v6 = parse_site_entry("2001:db8::10").unwrap();
        assert_eq!(
            v6.servers[0].ip_addr(),
            "2001:db8::10".parse::<IpAddr>().unwrap()
        );
        assert_eq!(v6.servers[0].interfaces[0].port, DEFAULT_UDP_PORT);

        assert!(parse_site_entry("bogus").is_err());
    }

    #[test]
    fn overrides_keyed_by_uppercased_prefix() {
        let config = ClientConfig::default_with_overrides(|c| {
            c.bootstrap.overrides.push(PrefixOverride {
                prefix: "test.prefix".to_string(),
                server: "192.0.2.50".to_string(),
            });
        });
        let overrides = config.site_overrides().unwrap();
        assert!(overrides.contains_key("TEST.PREFIX"));
    }

    #[test]
    fn protocol_preference_parses() {
        let config = ClientConfig::default();
        assert_eq!(
            config.resolution.protocols(),
            vec![
                InterfaceProtocol::Udp,
                InterfaceProtocol::Tcp,
                InterfaceProtocol::Http,
                InterfaceProtocol::Https,
            ]
        );
    }
}
