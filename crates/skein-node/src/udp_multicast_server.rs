//! Multicast receiver feeding local network announcements into the pipeline.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use skein_core::config::LocalNetworkDiscoveryConfig;
use skein_core::{Completer, Event, Handler, HandlerContext, HandlerMask, HandlerResult};
use skein_transport::{AsyncUdpTransport, Transport};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::udp_server::{OnFailure, receive_loop};

/// Joins the local network discovery group between `NodeUp` and `NodeDown`
/// and passes every datagram received on it inbound.
///
/// The group socket is bound with address reuse, so every node on a host
/// receives the announcements. Outbound announcements leave through the
/// unicast [`crate::UdpServer`]. Failing to bind the group port is logged
/// and leaves the node running without local network discovery.
pub struct UdpMulticastServer {
    group: SocketAddrV4,
    interface: Ipv4Addr,
    max_datagram_size: usize,
    bound: Arc<Mutex<Option<SocketAddr>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMulticastServer {
    /// Create the stage for the configured group.
    #[must_use]
    pub fn new(config: &LocalNetworkDiscoveryConfig, max_datagram_size: usize) -> Self {
        Self {
            group: config.multicast_address,
            interface: config.multicast_interface,
            max_datagram_size,
            bound: Arc::default(),
            receiver: Mutex::new(None),
        }
    }

    /// Address the group socket is bound to, once bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound)
    }

    /// Whether the receive loop is running.
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        lock(&self.receiver)
            .as_ref()
            .is_some_and(|receiver| !receiver.is_finished())
    }

    fn start(&self, ctx: &HandlerContext) {
        let mut receiver = lock(&self.receiver);
        if receiver.is_some() {
            return;
        }
        let (group, interface) = (self.group, self.interface);
        let max_datagram_size = self.max_datagram_size;
        let bound = self.bound.clone();
        let weak = ctx.downgrade();
        *receiver = Some(ctx.executors().spawn_independent(async move {
            let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
            let transport = match AsyncUdpTransport::bind_reusable(listen).await {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(%listen, "unable to bind multicast server: {err}");
                    return;
                }
            };
            let local = transport.local_addr().ok();
            *lock(&bound) = local;
            if let Err(err) = transport.join_multicast_v4(*group.ip(), interface) {
                warn!(%group, %interface, "unable to join multicast group: {err}");
            }
            debug!(?local, %group, "multicast server started");
            receive_loop(Arc::new(transport), weak, max_datagram_size, OnFailure::Stop).await;
        }));
    }

    fn stop(&self) {
        if let Some(receiver) = lock(&self.receiver).take() {
            debug!(group = %self.group, "stopping multicast server");
            receiver.abort();
        }
        lock(&self.bound).take();
    }
}

impl Drop for UdpMulticastServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Handler for UdpMulticastServer {
    fn mask(&self) -> HandlerMask {
        HandlerMask::EVENT
    }

    fn on_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        self.stop();
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => self.start(ctx),
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => self.stop(),
            _ => {}
        }
        ctx.pass_event(event, done);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
