//! Async UDP transport.

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::debug;

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// UDP transport on a tokio socket.
///
/// Closing wakes any task parked in [`Transport::recv_from`], so a receive
/// loop ends without waiting for another datagram.
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
/// println!("Listening on {}", transport.local_addr()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
    max_datagram_size: usize,
}

impl AsyncUdpTransport {
    /// Bind with default socket options.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the socket cannot be created
    /// or bound.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with(addr, &TransportConfig::default()).await
    }

    /// Bind with explicit socket options.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the socket cannot be created,
    /// configured or bound.
    pub async fn bind_with<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        Self::open(addr.into(), config, false)
    }

    /// Bind a socket other sockets on this host may bind to as well.
    ///
    /// Several nodes on one host listen on the same multicast port this way.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the socket cannot be created,
    /// configured or bound.
    pub async fn bind_reusable<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::open(addr.into(), &TransportConfig::default(), true)
    }

    fn open(addr: SocketAddr, config: &TransportConfig, reuse: bool) -> TransportResult<Self> {
        let bind_failed = |e: std::io::Error| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        };

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_failed)?;

        if reuse {
            socket.set_reuse_address(true).map_err(bind_failed)?;
            #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
            socket.set_reuse_port(true).map_err(bind_failed)?;
        }
        socket
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_failed)?;
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_failed)?;
        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;
        debug!(requested = %addr, bound = ?socket.local_addr().ok(), reuse, "udp transport bound");

        Ok(Self::wrap(socket, config.max_datagram_size))
    }

    /// Join the IPv4 multicast `group` on `interface` and receive the
    /// group's datagrams, including those sent from this host.
    ///
    /// # Errors
    /// Returns [`TransportError::Io`] if the operating system refuses the
    /// membership, e.g. when no interface supports multicast.
    pub fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> TransportResult<()> {
        self.socket.join_multicast_v4(group, interface)?;
        self.socket.set_multicast_loop_v4(true)?;
        Ok(())
    }

    /// Wrap an already bound tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self::wrap(socket, TransportConfig::default().max_datagram_size)
    }

    fn wrap(socket: UdpSocket, max_datagram_size: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(closed),
            counters: Arc::new(Counters::default()),
            max_datagram_size,
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if buf.len() > self.max_datagram_size {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::TooLarge {
                size: buf.len(),
                max: self.max_datagram_size,
            });
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            received = self.socket.recv_from(buf) => match received {
                Ok((size, addr)) => {
                    self.counters
                        .bytes_received
                        .fetch_add(size as u64, Ordering::Relaxed);
                    self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    Ok((size, addr))
                }
                Err(e) => {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    Err(TransportError::Io(e))
                }
            },
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn loopback() -> AsyncUdpTransport {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        AsyncUdpTransport::bind(addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = loopback().await;
        let bound_addr = transport.local_addr().unwrap();
        assert_ne!(bound_addr.port(), 0);
        assert!(bound_addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_send_recv() {
        let server = loopback().await;
        let client = loopback().await;

        let sent = client
            .send_to(b"hello skein", server.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(sent, 11);

        let mut buf = vec![0u8; 1500];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        assert_eq!(&buf[..size], b"hello skein");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_stats() {
        let server = loopback().await;
        let client = loopback().await;
        assert_eq!(client.stats(), TransportStats::default());

        client.send_to(b"Test", server.local_addr().unwrap()).await.unwrap();
        let stats = client.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 4);

        let mut buf = vec![0u8; 1500];
        timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        let stats = server.stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_udp_close_fails_operations() {
        let transport = loopback().await;
        assert!(!transport.is_closed());

        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"test", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        let mut buf = [0u8; 16];
        assert!(matches!(
            transport.recv_from(&mut buf).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let transport = loopback().await;
        let receiver = transport.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            receiver.recv_from(&mut buf).await
        });
        tokio::task::yield_now().await;

        transport.close().await.unwrap();
        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("receive not woken")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let config = TransportConfig {
            max_datagram_size: 100,
            ..TransportConfig::default()
        };
        let transport = AsyncUdpTransport::bind_with(([127, 0, 0, 1], 0), &config)
            .await
            .unwrap();
        let result = transport
            .send_to(&[0u8; 101], "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(
            result,
            Err(TransportError::TooLarge { size: 101, max: 100 })
        ));
        assert_eq!(transport.stats().send_errors, 1);
    }

    #[tokio::test]
    async fn test_udp_multiple_packets() {
        let server = loopback().await;
        let client = loopback().await;
        let server_addr = server.local_addr().unwrap();

        for i in 0..10 {
            let data = format!("Packet {i}");
            client.send_to(data.as_bytes(), server_addr).await.unwrap();
        }

        let mut buf = vec![0u8; 1500];
        for _ in 0..10 {
            let result = timeout(Duration::from_secs(1), server.recv_from(&mut buf)).await;
            assert!(result.is_ok(), "Timeout receiving packet");
        }
        assert_eq!(client.stats().packets_sent, 10);
        assert_eq!(server.stats().packets_received, 10);
    }

    #[tokio::test]
    async fn test_udp_from_socket() {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();

        let tokio_socket = UdpSocket::from_std(std_socket).unwrap();
        let transport = AsyncUdpTransport::from_socket(tokio_socket);

        assert!(!transport.is_closed());
        assert!(transport.local_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn test_reusable_bind_shares_port() {
        let first = AsyncUdpTransport::bind_reusable(([0, 0, 0, 0], 0)).await.unwrap();
        let port = first.local_addr().unwrap().port();
        let second = AsyncUdpTransport::bind_reusable(([0, 0, 0, 0], port)).await.unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);

        // A plain bind on the same port is still refused.
        assert!(matches!(
            AsyncUdpTransport::bind(([0, 0, 0, 0], port)).await,
            Err(TransportError::BindFailed { .. })
        ));
    }
}
