//! Test fixtures
//!
//! - [`MemoryNetwork`]: datagram network in memory, with optional NAT-like
//!   filtering per endpoint
//! - [`TestNode`]: a [`skein_node::Node`] on that network recording its events

mod network;
mod node;

pub use network::{MemoryNetwork, MemoryTransport};
pub use node::{TestNode, test_config};
