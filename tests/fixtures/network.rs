//! In-memory datagram network.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use skein_transport::{Transport, TransportError, TransportResult};
use tokio::sync::{Mutex, mpsc, watch};

type Datagram = (Bytes, SocketAddr);

#[derive(Default)]
struct Shared {
    endpoints: DashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    firewalled: DashSet<SocketAddr>,
    // (inside, outside) pairs a firewalled endpoint has sent to
    holes: DashSet<(SocketAddr, SocketAddr)>,
    delivered: DashMap<(SocketAddr, SocketAddr), usize>,
    next_host: AtomicU8,
}

/// Datagram network connecting [`MemoryTransport`]s.
///
/// An endpoint attached behind a firewall only accepts datagrams from
/// addresses it has sent to before, which is what hole punching relies on.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    /// Empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint reachable by anyone.
    #[must_use]
    pub fn attach(&self) -> MemoryTransport {
        self.attach_with(false)
    }

    /// Attach an endpoint behind a firewall.
    #[must_use]
    pub fn attach_firewalled(&self) -> MemoryTransport {
        self.attach_with(true)
    }

    fn attach_with(&self, firewalled: bool) -> MemoryTransport {
        let host = self.shared.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        let address = SocketAddr::from((Ipv4Addr::new(10, 0, 0, host), 22527));
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.endpoints.insert(address, tx);
        if firewalled {
            self.shared.firewalled.insert(address);
        }
        let (closed, _) = watch::channel(false);
        MemoryTransport {
            address,
            network: self.clone(),
            inbox: Mutex::new(rx),
            closed,
        }
    }

    /// Take `address` off the network; datagrams to it are lost from now on.
    pub fn detach(&self, address: SocketAddr) {
        self.shared.endpoints.remove(&address);
    }

    /// Datagrams delivered from `from` to `to` so far.
    #[must_use]
    pub fn delivered(&self, from: SocketAddr, to: SocketAddr) -> usize {
        self.shared
            .delivered
            .get(&(from, to))
            .map_or(0, |count| *count)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: Bytes) {
        self.shared.holes.insert((from, to));
        if self.shared.firewalled.contains(&to) && !self.shared.holes.contains(&(to, from)) {
            tracing::trace!(%from, %to, "datagram filtered");
            return;
        }
        let Some(endpoint) = self.shared.endpoints.get(&to) else {
            tracing::trace!(%from, %to, "datagram to unknown address lost");
            return;
        };
        if endpoint.send((datagram, from)).is_ok() {
            *self.shared.delivered.entry((from, to)).or_default() += 1;
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    address: SocketAddr,
    network: MemoryNetwork,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.network
            .deliver(self.address, addr, Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            received = inbox.recv() => match received {
                Some((datagram, from)) => {
                    let size = datagram.len().min(buf.len());
                    buf[..size].copy_from_slice(&datagram[..size]);
                    Ok((size, from))
                }
                None => Err(TransportError::Closed),
            },
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.address)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        self.network.detach(self.address);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
