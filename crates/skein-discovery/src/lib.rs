//! # skein Discovery
//!
//! Discovery and NAT traversal for skein nodes.
//!
//! This crate provides:
//! - [`InternetDiscovery`], the pipeline stage tracking peers through
//!   ping/pong heartbeats, picking the best super peer and relaying
//! - Rendezvous ("unite") between two peers a super peer relays for, so
//!   they can punch through their NATs
//! - Super peer selection by observed latency
//! - [`LocalHostDiscovery`], finding nodes on the same host through a
//!   shared directory of announcement files
//! - [`LocalNetworkDiscovery`], finding nodes on the same network segment
//!   through multicast announcements

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod internet;
pub mod local_host;
pub mod local_network;
pub mod peer;
pub mod selection;

pub use internet::{INTERNET_DISCOVERY_PATH, InternetDiscovery};
pub use local_host::{LOCAL_HOST_DISCOVERY_PATH, LocalHostDiscovery};
pub use local_network::{LOCAL_NETWORK_DISCOVERY_PATH, LocalNetworkDiscovery};
pub use peer::{Peer, Ping};
pub use selection::select_super_peer;
