//! Node configuration
//!
//! Every section deserializes from TOML with per-field defaults, so a config
//! file only has to name what differs from the defaults. Durations are
//! stored as milliseconds on the wire and exposed as [`Duration`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skein_crypto::IdentityPublicKey;
use thiserror::Error;

use crate::protocol::FIXED_HEADER_SIZE;

/// Configuration validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Overlay network id; envelopes from other networks are dropped
    #[serde(default)]
    pub network_id: i32,
    /// UDP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Message limits and pipeline budget
    #[serde(default)]
    pub message: MessageConfig,
    /// Discovery and heartbeat tuning
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Super peers this node attaches to
    #[serde(default)]
    pub super_peer: SuperPeerConfig,
    /// Control message rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Application type allow-lists
    #[serde(default)]
    pub serialization: SerializationConfig,
    /// Fixed key to address routes
    #[serde(default)]
    pub static_routes: HashMap<IdentityPublicKey, SocketAddr>,
    /// Discovery of nodes on the same host through a shared directory
    #[serde(default)]
    pub local_host_discovery: LocalHostDiscoveryConfig,
    /// Discovery of nodes on the same network through IP multicast
    #[serde(default)]
    pub local_network_discovery: LocalNetworkDiscoveryConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network_id: 0,
            listen_addr: default_listen_addr(),
            message: MessageConfig::default(),
            discovery: DiscoveryConfig::default(),
            super_peer: SuperPeerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            serialization: SerializationConfig::default(),
            static_routes: HashMap::new(),
            local_host_discovery: LocalHostDiscoveryConfig::default(),
            local_network_discovery: LocalNetworkDiscoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // magic + length prefix + largest chunk header + at least one payload byte
        let min_mtu = 4 + 2 + FIXED_HEADER_SIZE + 32 + 1;
        if self.message.mtu < min_mtu {
            return Err(ConfigError::Invalid {
                field: "message.mtu",
                reason: format!("must be at least {min_mtu}"),
            });
        }
        if self.message.hop_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "message.hop_limit",
                reason: "must be greater than zero".into(),
            });
        }
        if self.discovery.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery.ping_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.discovery.ping_timeout_ms < self.discovery.ping_interval_ms {
            return Err(ConfigError::Invalid {
                field: "discovery.ping_timeout_ms",
                reason: "must not be shorter than the ping interval".into(),
            });
        }
        if self.super_peer.enabled && self.super_peer.endpoints.is_empty() {
            return Err(ConfigError::Invalid {
                field: "super_peer.endpoints",
                reason: "super peers enabled but none configured".into(),
            });
        }
        if self.local_host_discovery.enabled && self.local_host_discovery.lease_time_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "local_host_discovery.lease_time_ms",
                reason: "must be greater than zero".into(),
            });
        }
        let group = self.local_network_discovery.multicast_address;
        if self.local_network_discovery.enabled && !group.ip().is_multicast() {
            return Err(ConfigError::Invalid {
                field: "local_network_discovery.multicast_address",
                reason: format!("{group} is not a multicast address"),
            });
        }
        Ok(())
    }
}

/// Message limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageConfig {
    /// Largest datagram written to the network
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Largest message, chunked or not (0 = unlimited)
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    /// How long a chunked message may take to arrive completely
    #[serde(default = "default_composed_timeout")]
    pub composed_message_transfer_timeout_ms: u64,
    /// Maximum number of relays an envelope may pass
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
    /// Outbound messages in flight before writes fail (0 = unbounded)
    #[serde(default)]
    pub buffer_size: usize,
    /// Arm outbound and require armed inbound envelopes
    #[serde(default = "default_true")]
    pub arm_enabled: bool,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            max_content_length: default_max_content_length(),
            composed_message_transfer_timeout_ms: default_composed_timeout(),
            hop_limit: default_hop_limit(),
            buffer_size: 0,
            arm_enabled: true,
        }
    }
}

impl MessageConfig {
    /// Reassembly timeout for chunked messages.
    #[must_use]
    pub fn composed_message_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.composed_message_transfer_timeout_ms)
    }
}

/// Discovery and heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run the internet discovery stage
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Heartbeat period
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    /// Peers without control traffic for this long are removed
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Direct connections without application traffic for this long are dropped
    #[serde(default = "default_ping_communication_timeout")]
    pub ping_communication_timeout_ms: u64,
    /// Maximum number of outstanding pings
    #[serde(default = "default_ping_max_peers")]
    pub ping_max_peers: usize,
    /// Cooldown between unite attempts for the same pair (0 disables unites)
    #[serde(default = "default_unite_min_interval")]
    pub unite_min_interval_ms: u64,
    /// Required proof-of-work difficulty of senders
    #[serde(default = "default_pow_difficulty")]
    pub proof_of_work_difficulty: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping_interval_ms: default_ping_interval(),
            ping_timeout_ms: default_ping_timeout(),
            ping_communication_timeout_ms: default_ping_communication_timeout(),
            ping_max_peers: default_ping_max_peers(),
            unite_min_interval_ms: default_unite_min_interval(),
            proof_of_work_difficulty: default_pow_difficulty(),
        }
    }
}

impl DiscoveryConfig {
    /// Heartbeat period.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Control traffic timeout.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Application traffic timeout.
    #[must_use]
    pub fn ping_communication_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_communication_timeout_ms)
    }

    /// Unite cooldown; `None` when unites are disabled.
    #[must_use]
    pub fn unite_min_interval(&self) -> Option<Duration> {
        (self.unite_min_interval_ms > 0).then(|| Duration::from_millis(self.unite_min_interval_ms))
    }
}

/// Shared-directory discovery of nodes on this host
///
/// Every node writes the addresses it listens on to
/// `<path>/<network id>/<public key>.toml` and picks up the files of the
/// others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHostDiscoveryConfig {
    /// Run the local host discovery stage
    #[serde(default)]
    pub enabled: bool,
    /// Directory shared by the nodes of this host
    #[serde(default = "default_local_host_path")]
    pub path: PathBuf,
    /// Files not refreshed within this window are ignored
    #[serde(default = "default_lease_time")]
    pub lease_time_ms: u64,
    /// Rescan as soon as the directory changes instead of only on refresh
    #[serde(default = "default_true")]
    pub watch_enabled: bool,
}

impl Default for LocalHostDiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_local_host_path(),
            lease_time_ms: default_lease_time(),
            watch_enabled: true,
        }
    }
}

impl LocalHostDiscoveryConfig {
    /// How long a written file stays valid.
    #[must_use]
    pub fn lease_time(&self) -> Duration {
        Duration::from_millis(self.lease_time_ms)
    }

    /// How often the own file is rewritten: five seconds before the lease
    /// runs out, but at least every second.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.lease_time()
            .saturating_sub(Duration::from_secs(5))
            .max(Duration::from_secs(1))
    }
}

/// Multicast discovery of nodes on the local network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNetworkDiscoveryConfig {
    /// Run the local network discovery stage and its multicast socket
    #[serde(default)]
    pub enabled: bool,
    /// Group and port the discovery pings go to
    #[serde(default = "default_multicast_address")]
    pub multicast_address: SocketAddrV4,
    /// Interface the group is joined on; unspecified lets the OS pick
    #[serde(default = "default_multicast_interface")]
    pub multicast_interface: Ipv4Addr,
}

impl Default for LocalNetworkDiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            multicast_address: default_multicast_address(),
            multicast_interface: default_multicast_interface(),
        }
    }
}

/// Super peer attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuperPeerConfig {
    /// Use super peers; a node with this disabled acts as a super peer itself
    #[serde(default)]
    pub enabled: bool,
    /// Known super peers
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Address and identity of a remote node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// UDP address
    pub address: SocketAddr,
    /// Public key (hex)
    pub public_key: IdentityPublicKey,
}

/// Control message rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable the rate limiter
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Control messages allowed per sender and window
    #[serde(default = "default_max_control_messages")]
    pub max_control_messages: usize,
    /// Window length
    #[serde(default = "default_rate_window")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_control_messages: default_max_control_messages(),
            window_ms: default_rate_window(),
        }
    }
}

impl RateLimitConfig {
    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Application type allow-lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializationConfig {
    /// Type names accepted from the network (`*` accepts any)
    #[serde(default = "default_types")]
    pub inbound: Vec<String>,
    /// Type names the application may send (`*` accepts any)
    #[serde(default = "default_types")]
    pub outbound: Vec<String>,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            inbound: default_types(),
            outbound: default_types(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 22527))
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> usize {
    1400
}

fn default_max_content_length() -> usize {
    4 * 1024 * 1024
}

fn default_composed_timeout() -> u64 {
    60_000
}

fn default_hop_limit() -> u8 {
    8
}

fn default_ping_interval() -> u64 {
    5_000
}

fn default_ping_timeout() -> u64 {
    30_000
}

fn default_ping_communication_timeout() -> u64 {
    60_000
}

fn default_ping_max_peers() -> usize {
    100
}

fn default_unite_min_interval() -> u64 {
    20_000
}

fn default_pow_difficulty() -> u8 {
    6
}

fn default_max_control_messages() -> usize {
    50
}

fn default_rate_window() -> u64 {
    1_000
}

fn default_types() -> Vec<String> {
    vec!["bytes".to_string(), "string".to_string()]
}

fn default_local_host_path() -> PathBuf {
    std::env::temp_dir().join("skein-discovery")
}

fn default_lease_time() -> u64 {
    60_000
}

fn default_multicast_address() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(239, 22, 5, 27), 22527)
}

fn default_multicast_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_log_level() -> String {
    "info".to_string()
}
