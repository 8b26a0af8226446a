//! # skein Transport
//!
//! Datagram transport for skein nodes.
//!
//! This crate provides:
//! - The [`Transport`] trait the node's UDP server stage writes through
//! - [`AsyncUdpTransport`], a tokio UDP socket configured through socket2

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp_async;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;

/// Socket options applied when binding
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size
    pub recv_buffer_size: usize,
    /// Send buffer size
    pub send_buffer_size: usize,
    /// Largest datagram accepted by `recv_from` callers
    pub max_datagram_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            max_datagram_size: 65_535,
        }
    }
}
