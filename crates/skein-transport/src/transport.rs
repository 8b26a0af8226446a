//! Transport trait the node writes datagrams through.
//!
//! The UDP server stage only needs to send a datagram to an address and to
//! receive the next datagram with its source. Anything able to do that, a
//! UDP socket or an in-memory test network, can carry a node.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Requested address
        addr: SocketAddr,
        /// Failure description
        reason: String,
    },

    /// Datagram exceeds what the transport can carry
    #[error("Datagram of {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Datagram size
        size: usize,
        /// Transport limit
        max: usize,
    },
}

impl TransportError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
            Self::Closed | Self::BindFailed { .. } | Self::TooLarge { .. } => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// # Examples
///
/// ```no_run
/// use skein_transport::{AsyncUdpTransport, Transport};
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = AsyncUdpTransport::bind(addr).await?;
///
/// transport.send_to(b"ping", "127.0.0.1:22527".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("{size} bytes from {from}");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`, returning the number of bytes sent.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] after [`Transport::close`], or the
    /// underlying I/O error.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive the next datagram into `buf`.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] after [`Transport::close`], or the
    /// underlying I/O error.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport. Later sends and receives fail with
    /// [`TransportError::Closed`].
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Whether [`Transport::close`] was called.
    fn is_closed(&self) -> bool;

    /// Traffic counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total datagrams sent
    pub packets_sent: u64,
    /// Total datagrams received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed {
            addr: "127.0.0.1:1".parse().unwrap(),
            reason: "in use".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to bind to 127.0.0.1:1: in use");

        let err = TransportError::TooLarge { size: 70_000, max: 65_535 };
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::from(io::Error::from(io::ErrorKind::WouldBlock)).is_transient());
        assert!(
            TransportError::from(io::Error::from(io::ErrorKind::ConnectionRefused)).is_transient()
        );
        assert!(!TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied))
            .is_transient());
        assert!(!TransportError::Closed.is_transient());
    }
}
