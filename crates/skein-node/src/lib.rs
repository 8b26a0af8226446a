//! # skein Node
//!
//! Runs a skein overlay node on a UDP transport.
//!
//! This crate provides:
//! - [`Node`], which assembles the pipeline and drives its lifecycle
//! - [`UdpServer`], the stage between the pipeline and the transport
//! - [`UdpMulticastServer`], the receiver for local network announcements
//! - Loading and saving of the TOML node configuration
//! - Log subscriber setup from the configured level

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod udp_multicast_server;
pub mod udp_server;

pub use error::{NodeError, Result};
pub use node::{Node, build_pipeline, stages};
pub use udp_multicast_server::UdpMulticastServer;
pub use udp_server::UdpServer;
