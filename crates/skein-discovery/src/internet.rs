//! Internet discovery stage.
//!
//! Tracks remote peers through ping/pong exchanges, keeps the path to the
//! configured super peers alive and routes outbound envelopes either
//! directly to a known peer or through the best super peer.
//!
//! A node that does not use super peers acts as one: it answers children
//! joins, relays envelopes between its children and introduces the two
//! ends of a relayed conversation to each other with unite messages, so
//! they can establish a direct path.
//!
//! The heartbeat timer runs on the independent executor and hands every
//! tick to the dependent executor, where the stage's own work runs. The
//! timer holds only a weak context, so it ends once the pipeline is gone.
//! Every tick:
//!
//! 1. removes peers without control traffic within the ping timeout
//! 2. pings every configured super peer (with a children join)
//! 3. pings direct connection peers that still carry application traffic
//!    and drops the others

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use rand::Rng;
use skein_core::config::{Endpoint, NodeConfig};
use skein_core::handler::drop_message;
use skein_core::{
    Address, Body, Completer, Event, ExpiringMap, Handler, HandlerContext, HandlerError,
    HandlerMask, HandlerResult, Message, MessageType, Nonce, PathId, PipelineError,
    PolicyViolation, RemoteEnvelope,
};
use skein_crypto::IdentityPublicKey;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::peer::{Peer, Ping};
use crate::selection::select_super_peer;

/// Path id under which discovered peers are registered.
pub const INTERNET_DISCOVERY_PATH: PathId = "internet-discovery";

/// Unordered peer pairs remembered for the unite cooldown.
const UNITE_ATTEMPTS_CAPACITY: usize = 1_000;

type PeerPair = (IdentityPublicKey, IdentityPublicKey);

/// Discovery and routing stage.
pub struct InternetDiscovery {
    state: Arc<State>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    open_pings: ExpiringMap<Nonce, Ping>,
    unite_attempts: Option<ExpiringMap<PeerPair, ()>>,
    peers: DashMap<IdentityPublicKey, Peer>,
    direct_connections: DashSet<IdentityPublicKey>,
    super_peers: Vec<Endpoint>,
    best_super_peer: Mutex<Option<IdentityPublicKey>>,
    uses_super_peers: bool,
    ping_interval: Duration,
    ping_timeout: Duration,
    communication_timeout: Duration,
}

impl InternetDiscovery {
    /// Create the stage from the node configuration.
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        let discovery = &config.discovery;
        let unite_attempts = discovery
            .unite_min_interval()
            .map(|interval| ExpiringMap::new(UNITE_ATTEMPTS_CAPACITY, interval));
        Self {
            state: Arc::new(State {
                open_pings: ExpiringMap::new(discovery.ping_max_peers, discovery.ping_timeout()),
                unite_attempts,
                peers: DashMap::new(),
                direct_connections: DashSet::new(),
                super_peers: config.super_peer.endpoints.clone(),
                best_super_peer: Mutex::new(None),
                uses_super_peers: config.super_peer.enabled,
                ping_interval: discovery.ping_interval(),
                ping_timeout: discovery.ping_timeout(),
                communication_timeout: discovery.ping_communication_timeout(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    /// Snapshot of what is known about `key`.
    #[must_use]
    pub fn peer(&self, key: &IdentityPublicKey) -> Option<Peer> {
        self.state.peers.get(key).map(|peer| peer.clone())
    }

    /// Number of tracked peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.peers.len()
    }

    /// Super peer currently used as gateway.
    #[must_use]
    pub fn best_super_peer(&self) -> Option<IdentityPublicKey> {
        *lock(&self.state.best_super_peer)
    }

    /// Whether a direct path to `key` is being kept warm.
    #[must_use]
    pub fn is_direct_connection(&self, key: &IdentityPublicKey) -> bool {
        self.state.direct_connections.contains(key)
    }

    /// Pings waiting for their pong.
    #[must_use]
    pub fn open_pings(&self) -> usize {
        self.state.open_pings.len()
    }

    /// Whether the heartbeat task is running.
    #[must_use]
    pub fn is_heartbeat_running(&self) -> bool {
        lock(&self.heartbeat).is_some()
    }

    fn start_heartbeat(&self, ctx: &HandlerContext) {
        let mut heartbeat = lock(&self.heartbeat);
        if heartbeat.is_some() {
            return;
        }
        let period = self.state.ping_interval;
        let millis = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..millis));
        debug!(?period, ?jitter, "starting heartbeat");

        let state = self.state.clone();
        let weak = ctx.downgrade();
        *heartbeat = Some(ctx.executors().spawn_independent(async move {
            let mut ticks = time::interval_at(Instant::now() + jitter, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    debug!("pipeline gone, heartbeat ends");
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
            debug!("stopping heartbeat");
            heartbeat.abort();
        }
    }

    fn handle_for_me(
        &self,
        ctx: &HandlerContext,
        address: SocketAddr,
        envelope: RemoteEnvelope,
        done: Completer,
    ) -> HandlerResult {
        let sender = envelope.sender();
        match envelope.message_type() {
            Ok(MessageType::Discovery | MessageType::Acknowledgement | MessageType::Unite) => {
                let body = match envelope.body() {
                    Ok(body) => body,
                    Err(err) => {
                        drop_message(ctx, &Address::Socket(address), err, done);
                        return Ok(());
                    }
                };
                match body {
                    Body::Discovery { children_time } => {
                        self.state
                            .handle_ping(ctx, address, sender, envelope.nonce(), children_time)?;
                    }
                    Body::Acknowledgement { correlation_id } => {
                        self.state.handle_pong(ctx, address, sender, correlation_id);
                    }
                    Body::Unite {
                        public_key,
                        address: advertised,
                    } if self.state.is_super_peer(&sender) => {
                        self.state.handle_unite(ctx, public_key, advertised);
                    }
                    _ => debug!(%sender, "ignoring unite from a node that is not a super peer"),
                }
                done.complete();
            }
            Ok(MessageType::Application) => {
                self.state.application_traffic(&sender);
                ctx.pass_inbound(Address::Socket(address), Message::Envelope(envelope), done);
            }
            Ok(_) => ctx.pass_inbound(Address::Socket(address), Message::Envelope(envelope), done),
            Err(err) => drop_message(ctx, &Address::Socket(address), err, done),
        }
        Ok(())
    }

    fn relay(
        &self,
        ctx: &HandlerContext,
        address: SocketAddr,
        recipient: IdentityPublicKey,
        envelope: RemoteEnvelope,
        done: Completer,
    ) {
        if self.state.uses_super_peers {
            drop_message(ctx, &Address::Socket(address), PolicyViolation::NotARelay, done);
            return;
        }
        match self.state.route(ctx, envelope.sender(), recipient) {
            Some(next_hop) => {
                trace!(sender = %envelope.sender(), %recipient, %next_hop, "relaying message");
                ctx.pass_outbound(Address::Socket(next_hop), Message::Envelope(envelope), done);
            }
            None => {
                debug!(sender = %envelope.sender(), %recipient, "no route for relayed message");
                done.fail(PipelineError::Unroutable);
            }
        }
    }
}

impl Drop for InternetDiscovery {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl Handler for InternetDiscovery {
    fn mask(&self) -> HandlerMask {
        HandlerMask::READ | HandlerMask::EVENT | HandlerMask::WRITE
    }

    fn on_removed(&self, ctx: &HandlerContext) -> HandlerResult {
        self.stop_heartbeat();
        self.state.reset(ctx);
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => self.start_heartbeat(ctx),
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => {
                self.stop_heartbeat();
                self.state.reset(ctx);
            }
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
        let (address, envelope) = match (sender, msg) {
            (Address::Socket(address), Message::Envelope(envelope)) => (address, envelope),
            (sender, msg) => {
                ctx.pass_inbound(sender, msg, done);
                return Ok(());
            }
        };
        match envelope.recipient() {
            Some(recipient) if recipient == ctx.identity().public_key() => {
                self.handle_for_me(ctx, address, envelope, done)
            }
            Some(recipient) => {
                self.relay(ctx, address, recipient, envelope, done);
                Ok(())
            }
            None => {
                ctx.pass_inbound(Address::Socket(address), Message::Envelope(envelope), done);
                Ok(())
            }
        }
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match (recipient, msg) {
            (Address::Peer(key), Message::Envelope(envelope)) => {
                self.state.application_traffic(&key);
                match self.state.route(ctx, envelope.sender(), key) {
                    Some(address) => {
                        trace!(recipient = %key, %address, "sending message");
                        ctx.pass_outbound(Address::Socket(address), Message::Envelope(envelope), done);
                    }
                    None => ctx.pass_outbound(Address::Peer(key), Message::Envelope(envelope), done),
                }
            }
            (recipient, msg) => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}

impl State {
    fn is_super_peer(&self, key: &IdentityPublicKey) -> bool {
        self.super_peers.iter().any(|endpoint| endpoint.public_key == *key)
    }

    fn do_heartbeat(&self, ctx: &HandlerContext) {
        self.remove_stale_peers(ctx);
        self.ping_super_peers(ctx);
        self.ping_direct_connection_peers(ctx);
    }

    fn remove_stale_peers(&self, ctx: &HandlerContext) {
        let stale: Vec<IdentityPublicKey> = self
            .peers
            .iter()
            .filter(|entry| !entry.value().has_control_traffic(self.ping_timeout))
            .map(|entry| *entry.key())
            .collect();
        for key in stale {
            debug!(peer = %key, timeout = ?self.ping_timeout, "no control traffic, removing peer");
            self.remove_peer(ctx, &key);
        }
    }

    fn ping_super_peers(&self, ctx: &HandlerContext) {
        if !self.uses_super_peers {
            return;
        }
        for endpoint in &self.super_peers {
            self.send_ping(ctx, endpoint.public_key, endpoint.address);
        }
    }

    fn ping_direct_connection_peers(&self, ctx: &HandlerContext) {
        let keys: Vec<IdentityPublicKey> = self.direct_connections.iter().map(|key| *key).collect();
        for key in keys {
            let target = self.peers.get(&key).and_then(|peer| {
                peer.has_application_traffic(self.communication_timeout)
                    .then(|| peer.address())
                    .flatten()
            });
            match target {
                Some(address) => self.send_ping(ctx, key, address),
                None => {
                    debug!(peer = %key, "no recent application traffic, dropping direct connection");
                    ctx.peers()
                        .remove_children_and_path(&key, INTERNET_DISCOVERY_PATH);
                    self.direct_connections.remove(&key);
                }
            }
        }
    }

    fn remove_peer(&self, ctx: &HandlerContext, key: &IdentityPublicKey) {
        if self.is_super_peer(key) {
            ctx.peers()
                .remove_super_peer_and_path(key, INTERNET_DISCOVERY_PATH);
        } else {
            ctx.peers()
                .remove_children_and_path(key, INTERNET_DISCOVERY_PATH);
        }
        self.peers.remove(key);
        self.direct_connections.remove(key);
        if *lock(&self.best_super_peer) == Some(*key) {
            self.determine_best_super_peer();
        }
    }

    fn reset(&self, ctx: &HandlerContext) {
        self.open_pings.clear();
        if let Some(attempts) = &self.unite_attempts {
            attempts.clear();
        }
        let keys: Vec<IdentityPublicKey> = self.peers.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.remove_peer(ctx, &key);
        }
        ctx.peers().remove_all_paths(INTERNET_DISCOVERY_PATH);
        *lock(&self.best_super_peer) = None;
    }

    fn send_ping(&self, ctx: &HandlerContext, recipient: IdentityPublicKey, address: SocketAddr) {
        let children_time = if self.is_super_peer(&recipient) {
            unix_millis()
        } else {
            0
        };
        let ping = match RemoteEnvelope::discovery(
            ctx.identity(),
            ctx.config().network_id,
            recipient,
            children_time,
        ) {
            Ok(ping) => ping,
            Err(err) => {
                warn!(%recipient, "unable to build ping: {err}");
                return;
            }
        };
        self.open_pings.insert(ping.nonce(), Ping::new(address));
        if let Some(mut peer) = self.peers.get_mut(&recipient) {
            peer.ping_sent();
        }
        trace!(%recipient, %address, children_time, "sending ping");
        ctx.pass_outbound(
            Address::Socket(address),
            Message::Envelope(ping),
            Completer::detached("ping"),
        );
    }

    fn handle_ping(
        &self,
        ctx: &HandlerContext,
        address: SocketAddr,
        sender: IdentityPublicKey,
        nonce: Nonce,
        children_time: u64,
    ) -> Result<(), HandlerError> {
        trace!(%sender, %address, children_time, "got ping");
        let children_join = children_time > 0;
        {
            let mut peer = self.peers.entry(sender).or_default();
            peer.set_address(address);
            peer.control_traffic_occurred();
            if children_join {
                peer.ping_occurred();
            }
        }
        if children_join {
            if !ctx.peers().children().contains(&sender) {
                debug!(%sender, %address, "adding child");
            }
            ctx.peers()
                .add_path_and_children(sender, INTERNET_DISCOVERY_PATH);
        }

        let pong = RemoteEnvelope::acknowledgement(
            ctx.identity(),
            ctx.config().network_id,
            sender,
            nonce,
        )?;
        trace!(%sender, %address, "sending pong");
        ctx.pass_outbound(
            Address::Socket(address),
            Message::Envelope(pong),
            Completer::detached("pong"),
        );
        Ok(())
    }

    fn handle_pong(
        &self,
        ctx: &HandlerContext,
        address: SocketAddr,
        sender: IdentityPublicKey,
        correlation_id: Nonce,
    ) {
        let Some(ping) = self.open_pings.remove(&correlation_id) else {
            trace!(%sender, %address, "pong for unknown ping");
            return;
        };
        let latency = {
            let mut peer = self.peers.entry(sender).or_default();
            peer.set_address(address);
            peer.control_traffic_occurred();
            peer.pong_occurred(&ping);
            peer.latency()
        };

        if self.is_super_peer(&sender) {
            trace!(super_peer = %sender, %address, ?latency, "got pong from super peer");
            if !ctx.peers().super_peers().contains(&sender) {
                debug!(super_peer = %sender, %address, "adding super peer");
            }
            ctx.peers()
                .add_path_and_super_peer(sender, INTERNET_DISCOVERY_PATH);
            self.determine_best_super_peer();
        } else {
            trace!(peer = %sender, %address, ?latency, "got pong");
            if !ctx.peers().paths(&sender).contains(INTERNET_DISCOVERY_PATH) {
                debug!(peer = %sender, %address, "adding peer");
            }
            ctx.peers().add_path(sender, INTERNET_DISCOVERY_PATH);
        }
    }

    fn handle_unite(&self, ctx: &HandlerContext, key: IdentityPublicKey, address: SocketAddr) {
        trace!(peer = %key, %address, "got unite");
        {
            let mut peer = self.peers.entry(key).or_default();
            peer.set_address(address);
            peer.control_traffic_occurred();
            peer.application_traffic_occurred();
        }
        self.direct_connections.insert(key);
        self.send_ping(ctx, key, address);
    }

    fn application_traffic(&self, key: &IdentityPublicKey) {
        if self.direct_connections.contains(key) {
            self.peers.entry(*key).or_default().application_traffic_occurred();
        }
    }

    fn determine_best_super_peer(&self) {
        let candidates: Vec<(IdentityPublicKey, Duration)> = self
            .super_peers
            .iter()
            .filter_map(|endpoint| {
                let peer = self.peers.get(&endpoint.public_key)?;
                if !peer.is_reachable(self.ping_timeout) {
                    return None;
                }
                Some((endpoint.public_key, peer.latency()?))
            })
            .collect();

        let mut best = lock(&self.best_super_peer);
        let selected = select_super_peer(*best, &candidates);
        let selected_key = selected.map(|(key, _)| key);
        if selected_key != *best {
            debug!(
                previous = ?best.map(|key| key.to_string()),
                new = ?selected_key.map(|key| key.to_string()),
                latency = ?selected.map(|(_, latency)| latency),
                "new best super peer"
            );
        }
        *best = selected_key;
    }

    fn best_super_peer_address(&self) -> Option<SocketAddr> {
        let best = (*lock(&self.best_super_peer))?;
        self.peers.get(&best).and_then(|peer| peer.address())
    }

    /// Next hop for an envelope from `sender` to `recipient`.
    ///
    /// Prefers a reachable peer over the best super peer. When this node is
    /// the gateway itself and both ends are known, it also introduces them
    /// to each other.
    fn route(
        &self,
        ctx: &HandlerContext,
        sender: IdentityPublicKey,
        recipient: IdentityPublicKey,
    ) -> Option<SocketAddr> {
        let gateway = self.best_super_peer_address();
        let direct = self.peers.get(&recipient).and_then(|peer| {
            peer.is_reachable(self.ping_timeout)
                .then(|| peer.address())
                .flatten()
        });

        let Some(recipient_address) = direct else {
            if gateway.is_some() {
                trace!(%recipient, "no direct path, using super peer");
            }
            return gateway;
        };

        if gateway.is_none() {
            let sender_address = self.peers.get(&sender).and_then(|peer| peer.address());
            if let Some(sender_address) = sender_address {
                if self.should_try_unite(sender, recipient) {
                    let task_ctx = ctx.clone();
                    ctx.executors().spawn_dependent(send_unites(
                        task_ctx,
                        (sender, sender_address),
                        (recipient, recipient_address),
                    ));
                }
            }
        }
        Some(recipient_address)
    }

    fn should_try_unite(&self, sender: IdentityPublicKey, recipient: IdentityPublicKey) -> bool {
        let pair = if sender < recipient {
            (sender, recipient)
        } else {
            (recipient, sender)
        };
        self.unite_attempts
            .as_ref()
            .is_some_and(|attempts| attempts.put_if_absent(pair, ()))
    }
}

/// Tell each end of a relayed conversation where to find the other.
async fn send_unites(
    ctx: HandlerContext,
    sender: (IdentityPublicKey, SocketAddr),
    recipient: (IdentityPublicKey, SocketAddr),
) {
    for ((to, to_address), (about, about_address)) in [(sender, recipient), (recipient, sender)] {
        let unite = match RemoteEnvelope::unite(
            ctx.identity(),
            ctx.config().network_id,
            to,
            about,
            about_address,
        ) {
            Ok(unite) => unite,
            Err(err) => {
                warn!(peer = %to, "unable to build unite: {err}");
                continue;
            }
        };
        trace!(peer = %to, %to_address, about = %about, %about_address, "sending unite");
        let (done, sent) = Completer::new();
        ctx.pass_outbound(Address::Socket(to_address), Message::Envelope(unite), done);
        if let Err(err) = sent.await {
            warn!(peer = %to, address = %to_address, "unable to send unite: {err}");
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .max(1)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
