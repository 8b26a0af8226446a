//! Liveness state of a remote peer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

/// What discovery knows about one remote peer.
///
/// Timestamps are `None` until the corresponding traffic was seen, so a
/// freshly created peer is neither alive nor reachable.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    address: Option<SocketAddr>,
    last_control_traffic: Option<Instant>,
    last_pong: Option<Instant>,
    last_application_traffic: Option<Instant>,
    last_ping: Option<Instant>,
    latency: Option<Duration>,
}

impl Peer {
    /// Create a peer with no traffic recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last address the peer was seen at.
    #[must_use]
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Record the address the peer was seen at.
    pub fn set_address(&mut self, address: SocketAddr) {
        self.address = Some(address);
    }

    /// Any inbound discovery message arrived.
    pub fn control_traffic_occurred(&mut self) {
        self.last_control_traffic = Some(Instant::now());
    }

    /// A ping with a children join arrived, proving the reverse path.
    pub fn ping_occurred(&mut self) {
        self.last_pong = Some(Instant::now());
    }

    /// A ping to the peer went out.
    pub fn ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
    }

    /// A pong answering `ping` arrived.
    pub fn pong_occurred(&mut self, ping: &Ping) {
        let now = Instant::now();
        self.last_pong = Some(now);
        self.last_ping = self.last_ping.max(Some(ping.sent()));
        self.latency = Some(now.saturating_duration_since(ping.sent()));
    }

    /// Application traffic went to or came from the peer.
    pub fn application_traffic_occurred(&mut self) {
        self.last_application_traffic = Some(Instant::now());
    }

    /// Whether control traffic arrived within `timeout`.
    #[must_use]
    pub fn has_control_traffic(&self, timeout: Duration) -> bool {
        within(self.last_control_traffic, timeout)
    }

    /// Whether application traffic occurred within `timeout`.
    #[must_use]
    pub fn has_application_traffic(&self, timeout: Duration) -> bool {
        within(self.last_application_traffic, timeout)
    }

    /// Whether the peer answered within `timeout`.
    #[must_use]
    pub fn is_reachable(&self, timeout: Duration) -> bool {
        within(self.last_pong, timeout)
    }

    /// When the last ping to the peer went out.
    #[must_use]
    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    /// Round trip of the last answered ping.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

fn within(at: Option<Instant>, window: Duration) -> bool {
    at.is_some_and(|at| at.elapsed() <= window)
}

/// An outstanding ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    address: SocketAddr,
    sent: Instant,
}

impl Ping {
    /// Ping sent now to `address`.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            sent: Instant::now(),
        }
    }

    /// Where the ping went.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// When the ping went out.
    #[must_use]
    pub fn sent(&self) -> Instant {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.1:22527".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_peer_is_not_alive() {
        let peer = Peer::new();
        assert!(!peer.has_control_traffic(Duration::from_secs(30)));
        assert!(!peer.is_reachable(Duration::from_secs(30)));
        assert!(peer.latency().is_none());
        assert!(peer.address().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_from_ping() {
        let ping = Ping::new(addr());
        tokio::time::advance(Duration::from_millis(40)).await;

        let mut peer = Peer::new();
        peer.pong_occurred(&ping);
        assert_eq!(peer.latency(), Some(Duration::from_millis(40)));
        assert!(peer.is_reachable(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_traffic_ages_out() {
        let mut peer = Peer::new();
        peer.control_traffic_occurred();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(peer.has_control_traffic(Duration::from_secs(30)));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!peer.has_control_traffic(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_ping_counts_as_reachable() {
        let mut peer = Peer::new();
        peer.ping_occurred();
        assert!(peer.is_reachable(Duration::from_secs(1)));
        assert!(peer.latency().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_ping_tracks_newest_ping() {
        let mut peer = Peer::new();
        assert!(peer.last_ping().is_none());

        let early = Ping::new(addr());
        tokio::time::advance(Duration::from_millis(10)).await;
        peer.ping_sent();
        let sent = peer.last_ping().unwrap();
        assert!(sent > early.sent());

        // A late pong for an older ping does not move the timestamp back.
        peer.pong_occurred(&early);
        assert_eq!(peer.last_ping(), Some(sent));
    }
}
