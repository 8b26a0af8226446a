//! Routing registry shared by all discovery stages.
//!
//! Several stages can know a direct path to the same peer (internet
//! discovery, static routes). The registry records which stage contributed
//! which path, and which peers are super peers or children of this node.
//! Transitions are reported as events:
//!
//! | Transition | Event |
//! |------------|-------|
//! | first path to a peer | `PeerDirect` |
//! | last path to a peer removed | `PeerRelay` |
//! | first super peer added | `NodeOnline` |
//! | last super peer removed | `NodeOffline` |

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use skein_crypto::IdentityPublicKey;
use tracing::debug;

use crate::message::Event;
use crate::pipeline::EventSink;

/// Identifies the stage that contributed a path.
pub type PathId = &'static str;

#[derive(Default)]
struct State {
    paths: HashMap<IdentityPublicKey, HashSet<PathId>>,
    children: HashSet<IdentityPublicKey>,
    super_peers: HashSet<IdentityPublicKey>,
}

impl State {
    fn add_path(&mut self, peer: IdentityPublicKey, path: PathId, events: &mut Vec<Event>) {
        let paths = self.paths.entry(peer).or_default();
        let first = paths.is_empty();
        if paths.insert(path) && first {
            events.push(Event::PeerDirect { peer });
        }
    }

    fn remove_path(&mut self, peer: &IdentityPublicKey, path: PathId, events: &mut Vec<Event>) {
        if let Some(paths) = self.paths.get_mut(peer) {
            if paths.remove(path) && paths.is_empty() {
                self.paths.remove(peer);
                events.push(Event::PeerRelay { peer: *peer });
            }
        }
    }
}

/// Paths, children and super peers of the local node.
pub struct PeersManager {
    state: RwLock<State>,
    events: EventSink,
}

impl PeersManager {
    /// Create an empty registry reporting to `events`.
    #[must_use]
    pub fn new(events: EventSink) -> Self {
        Self {
            state: RwLock::new(State::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut State, &mut Vec<Event>)) {
        let mut events = Vec::new();
        {
            let mut state: RwLockWriteGuard<'_, State> =
                self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut state, &mut events);
        }
        for event in events {
            debug!(?event, "routing state changed");
            (self.events)(event);
        }
    }

    /// Record a direct path to `peer`.
    pub fn add_path(&self, peer: IdentityPublicKey, path: PathId) {
        self.update(|state, events| state.add_path(peer, path, events));
    }

    /// Forget a direct path to `peer`.
    pub fn remove_path(&self, peer: &IdentityPublicKey, path: PathId) {
        self.update(|state, events| state.remove_path(peer, path, events));
    }

    /// Record a path to a super peer and mark it as such.
    pub fn add_path_and_super_peer(&self, peer: IdentityPublicKey, path: PathId) {
        self.update(|state, events| {
            state.add_path(peer, path, events);
            let was_offline = state.super_peers.is_empty();
            if state.super_peers.insert(peer) && was_offline {
                events.push(Event::NodeOnline);
            }
        });
    }

    /// Forget a super peer and its path.
    pub fn remove_super_peer_and_path(&self, peer: &IdentityPublicKey, path: PathId) {
        self.update(|state, events| {
            if state.super_peers.remove(peer) && state.super_peers.is_empty() {
                events.push(Event::NodeOffline);
            }
            state.remove_path(peer, path, events);
        });
    }

    /// Record a path to a child of this node.
    pub fn add_path_and_children(&self, peer: IdentityPublicKey, path: PathId) {
        self.update(|state, events| {
            state.add_path(peer, path, events);
            state.children.insert(peer);
        });
    }

    /// Forget a child and its path.
    pub fn remove_children_and_path(&self, peer: &IdentityPublicKey, path: PathId) {
        self.update(|state, events| {
            state.children.remove(peer);
            state.remove_path(peer, path, events);
        });
    }

    /// Paths currently known for `peer`.
    #[must_use]
    pub fn paths(&self, peer: &IdentityPublicKey) -> HashSet<PathId> {
        self.read().paths.get(peer).cloned().unwrap_or_default()
    }

    /// Whether at least one direct path to `peer` is known.
    #[must_use]
    pub fn has_path(&self, peer: &IdentityPublicKey) -> bool {
        self.read().paths.contains_key(peer)
    }

    /// Children of this node.
    #[must_use]
    pub fn children(&self) -> HashSet<IdentityPublicKey> {
        self.read().children.clone()
    }

    /// Super peers of this node.
    #[must_use]
    pub fn super_peers(&self) -> HashSet<IdentityPublicKey> {
        self.read().super_peers.clone()
    }

    /// Drop every path contributed by `path`, with the usual events.
    pub fn remove_all_paths(&self, path: PathId) {
        self.update(|state, events| {
            let peers: Vec<_> = state
                .paths
                .iter()
                .filter(|(_, paths)| paths.contains(path))
                .map(|(peer, _)| *peer)
                .collect();
            for peer in peers {
                if state.super_peers.remove(&peer) && state.super_peers.is_empty() {
                    events.push(Event::NodeOffline);
                }
                state.children.remove(&peer);
                state.remove_path(&peer, path, events);
            }
        });
    }

    /// Forget everything, reporting every lost peer.
    pub fn clear(&self) {
        self.update(|state, events| {
            if !state.super_peers.is_empty() {
                events.push(Event::NodeOffline);
            }
            events.extend(state.paths.keys().map(|peer| Event::PeerRelay { peer: *peer }));
            *state = State::default();
        });
    }
}
