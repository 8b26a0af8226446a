//! Local network discovery stage.
//!
//! Every heartbeat the node sends a discovery message without recipient to
//! the configured multicast group. Nodes receiving such a message from
//! another key remember the sender's address, register a path to it and
//! route envelopes for that key straight to the address. Peers whose last
//! announcement is older than the ping timeout are dropped.
//!
//! Announcements arrive through the multicast server stage, which sits at
//! the network end of the pipeline next to the unicast server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use skein_core::config::NodeConfig;
use skein_core::{
    Address, Body, Completer, Event, Handler, HandlerContext, HandlerMask, HandlerResult,
    Message, PathId, RemoteEnvelope,
};
use skein_crypto::IdentityPublicKey;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::peer::Peer;

/// Path id under which peers found on the local network are registered.
pub const LOCAL_NETWORK_DISCOVERY_PATH: PathId = "local-network-discovery";

/// Discovery of nodes on the same network segment through multicast.
pub struct LocalNetworkDiscovery {
    state: Arc<State>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    peers: DashMap<IdentityPublicKey, Peer>,
    group: SocketAddr,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl LocalNetworkDiscovery {
    /// Create the stage from the node configuration.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            state: Arc::new(State {
                peers: DashMap::new(),
                group: SocketAddr::V4(config.local_network_discovery.multicast_address),
                ping_interval: config.discovery.ping_interval(),
                ping_timeout: config.discovery.ping_timeout(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    /// Address announced by `key`, if it is known.
    #[must_use]
    pub fn route(&self, key: &IdentityPublicKey) -> Option<SocketAddr> {
        self.state.peers.get(key).and_then(|peer| peer.address())
    }

    /// Number of peers found on the local network.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    /// Whether the heartbeat is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.heartbeat)
            .as_ref()
            .is_some_and(|heartbeat| !heartbeat.is_finished())
    }

    fn start_heartbeat(&self, ctx: &HandlerContext) {
        let mut heartbeat = lock(&self.heartbeat);
        if heartbeat.is_some() {
            return;
        }
        let period = self.state.ping_interval;
        let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..millis));
        debug!(group = %self.state.group, ?period, ?jitter, "starting local network discovery");

        let state = self.state.clone();
        let weak = ctx.downgrade();
        *heartbeat = Some(ctx.executors().spawn_independent(async move {
            let mut ticks = time::interval_at(Instant::now() + jitter, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    debug!("pipeline gone, local network discovery ends");
                    return;
                };
                let state = state.clone();
                let executors = ctx.executors().clone();
                executors.spawn_dependent(async move { state.do_heartbeat(&ctx) });
            }
        }));
    }

    fn stop_heartbeat(&self) {
        if let Some(heartbeat) = lock(&self.heartbeat).take() {
            debug!("stopping local network discovery");
            heartbeat.abort();
        }
    }

    fn stop(&self, ctx: &HandlerContext) {
        self.stop_heartbeat();
        self.state.clear(ctx);
    }
}

impl Drop for LocalNetworkDiscovery {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl Handler for LocalNetworkDiscovery {
    fn mask(&self) -> HandlerMask {
        HandlerMask::DUPLEX
    }

    fn on_removed(&self, ctx: &HandlerContext) -> HandlerResult {
        self.stop(ctx);
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => self.start_heartbeat(ctx),
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => self.stop(ctx),
            _ => {}
        }
        ctx.pass_event(event, done);
        Ok(())
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match (sender, msg) {
            (Address::Socket(address), Message::Envelope(envelope))
                if self.is_running() && is_announcement(&envelope) =>
            {
                self.state.handle_announcement(ctx, address, &envelope);
                done.complete();
            }
            (sender, msg) => ctx.pass_inbound(sender, msg, done),
        }
        Ok(())
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let routed = match (&recipient, &msg) {
            (Address::Peer(key), Message::Envelope(_)) => self.route(key),
            _ => None,
        };
        match routed {
            Some(address) => {
                trace!(%recipient, %address, "using local network route");
                ctx.pass_outbound(Address::Socket(address), msg, done);
            }
            None => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}

fn is_announcement(envelope: &RemoteEnvelope) -> bool {
    envelope.recipient().is_none() && matches!(envelope.body(), Ok(Body::Discovery { .. }))
}

impl State {
    fn do_heartbeat(&self, ctx: &HandlerContext) {
        self.remove_stale_peers(ctx);
        self.announce(ctx);
    }

    fn remove_stale_peers(&self, ctx: &HandlerContext) {
        let stale: Vec<IdentityPublicKey> = self
            .peers
            .iter()
            .filter(|entry| !entry.value().has_control_traffic(self.ping_timeout))
            .map(|entry| *entry.key())
            .collect();
        for key in stale {
            debug!(peer = %key, timeout = ?self.ping_timeout, "no announcement, removing peer");
            self.peers.remove(&key);
            ctx.peers().remove_path(&key, LOCAL_NETWORK_DISCOVERY_PATH);
        }
    }

    fn announce(&self, ctx: &HandlerContext) {
        let announcement =
            match RemoteEnvelope::multicast_discovery(ctx.identity(), ctx.config().network_id) {
                Ok(announcement) => announcement,
                Err(err) => {
                    warn!("unable to build announcement: {err}");
                    return;
                }
            };
        trace!(group = %self.group, "announcing on local network");
        ctx.pass_outbound(
            Address::Socket(self.group),
            Message::Envelope(announcement),
            Completer::detached("local network announcement"),
        );
    }

    fn handle_announcement(
        &self,
        ctx: &HandlerContext,
        address: SocketAddr,
        envelope: &RemoteEnvelope,
    ) {
        let key = envelope.sender();
        if key == ctx.identity().public_key() {
            return;
        }
        let mut peer = self.peers.entry(key).or_insert_with(|| {
            debug!(peer = %key, %address, "peer found on local network");
            Peer::new()
        });
        peer.set_address(address);
        peer.control_traffic_occurred();
        drop(peer);
        ctx.peers().add_path(key, LOCAL_NETWORK_DISCOVERY_PATH);
    }

    fn clear(&self, ctx: &HandlerContext) {
        let keys: Vec<IdentityPublicKey> = self.peers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            ctx.peers().remove_path(&key, LOCAL_NETWORK_DISCOVERY_PATH);
        }
        self.peers.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use skein_core::{EventSink, Executors, Identity, Pipeline, Services};

    /// Records outbound messages at the network end.
    #[derive(Default)]
    struct Network {
        sent: StdMutex<Vec<(Address, RemoteEnvelope)>>,
    }

    impl Network {
        fn take(&self) -> Vec<(Address, RemoteEnvelope)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Handler for Network {
        fn mask(&self) -> HandlerMask {
            HandlerMask::WRITE
        }

        fn on_outbound(
            &self,
            _ctx: &HandlerContext,
            recipient: Address,
            msg: Message,
            done: Completer,
        ) -> HandlerResult {
            if let Message::Envelope(envelope) = msg {
                self.sent.lock().unwrap().push((recipient, envelope));
            }
            done.complete();
            Ok(())
        }
    }

    struct Harness {
        me: Identity,
        pipeline: Pipeline,
        discovery: Arc<LocalNetworkDiscovery>,
        network: Arc<Network>,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = NodeConfig::default();
            config.local_network_discovery.enabled = true;
            let me = Identity::generate(0);
            let sink: EventSink = Arc::new(|_| {});
            let discovery = Arc::new(LocalNetworkDiscovery::new(&config));
            let pipeline = Pipeline::new(Services::new(
                Arc::new(config),
                Arc::new(me.clone()),
                Executors::current().unwrap(),
                sink,
            ));
            let network = Arc::new(Network::default());
            pipeline.add_last("network", network.clone()).unwrap();
            pipeline
                .add_last(LOCAL_NETWORK_DISCOVERY_PATH, discovery.clone())
                .unwrap();
            Self {
                me,
                pipeline,
                discovery,
                network,
            }
        }

        async fn start(&self) {
            self.pipeline
                .process_event(Event::NodeUp { address: None })
                .await
                .unwrap();
        }

        async fn announce_from(&self, peer: &Identity, from: SocketAddr) {
            let announcement = RemoteEnvelope::multicast_discovery(peer, 0).unwrap();
            self.pipeline
                .process_inbound(Address::Socket(from), Message::Envelope(announcement))
                .await
                .unwrap();
        }

        fn ping_interval(&self) -> Duration {
            NodeConfig::default().discovery.ping_interval()
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, last], 22527))
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_announces_to_group() {
        let harness = Harness::new();
        harness.start().await;
        time::sleep(harness.ping_interval()).await;
        time::sleep(Duration::from_millis(1)).await;

        let sent = harness.network.take();
        assert!(!sent.is_empty());
        for (recipient, envelope) in sent {
            assert_eq!(recipient, Address::Socket("239.22.5.27:22527".parse().unwrap()));
            assert_eq!(envelope.sender(), harness.me.public_key());
            assert_eq!(envelope.recipient(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcement_adds_peer_and_route() {
        let harness = Harness::new();
        harness.start().await;
        let peer = Identity::generate(0);
        harness.announce_from(&peer, addr(7)).await;

        let peers = harness.pipeline.services().peers();
        assert_eq!(
            peers.paths(&peer.public_key()),
            [LOCAL_NETWORK_DISCOVERY_PATH].into()
        );
        assert_eq!(harness.discovery.route(&peer.public_key()), Some(addr(7)));

        let envelope = RemoteEnvelope::discovery(&harness.me, 0, peer.public_key(), 0).unwrap();
        harness
            .pipeline
            .process_outbound(Address::Peer(peer.public_key()), Message::Envelope(envelope))
            .await
            .unwrap();
        let sent = harness.network.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Address::Socket(addr(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_announcement_is_ignored() {
        let harness = Harness::new();
        harness.start().await;
        let me = harness.me.clone();
        harness.announce_from(&me, addr(1)).await;
        assert_eq!(harness.discovery.peer_count(), 0);
        assert!(!harness.pipeline.services().peers().has_path(&me.public_key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcements_pass_while_stopped() {
        let harness = Harness::new();
        let peer = Identity::generate(0);
        harness.announce_from(&peer, addr(7)).await;
        assert_eq!(harness.discovery.peer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_removed() {
        let harness = Harness::new();
        harness.start().await;
        let peer = Identity::generate(0);
        harness.announce_from(&peer, addr(7)).await;
        assert!(harness.pipeline.services().peers().has_path(&peer.public_key()));

        let timeout = NodeConfig::default().discovery.ping_timeout();
        time::sleep(timeout + harness.ping_interval() * 2).await;
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(harness.discovery.peer_count(), 0);
        assert!(!harness.pipeline.services().peers().has_path(&peer.public_key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_down_clears_peers() {
        let harness = Harness::new();
        harness.start().await;
        let peer = Identity::generate(0);
        harness.announce_from(&peer, addr(7)).await;

        harness.pipeline.process_event(Event::NodeDown).await.unwrap();
        assert!(!harness.discovery.is_running());
        assert_eq!(harness.discovery.peer_count(), 0);
        assert!(!harness.pipeline.services().peers().has_path(&peer.public_key()));
    }
}
