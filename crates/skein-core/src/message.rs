//! Messages, addresses and events travelling through the pipeline.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use skein_crypto::IdentityPublicKey;

use crate::protocol::RemoteEnvelope;

/// Where a message comes from or goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Overlay identity
    Peer(IdentityPublicKey),
    /// Network endpoint
    Socket(SocketAddr),
}

impl Address {
    /// Tag of this address variant.
    #[must_use]
    pub fn kind(&self) -> AddressKind {
        match self {
            Self::Peer(_) => AddressKind::Peer,
            Self::Socket(_) => AddressKind::Socket,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(key) => write!(f, "{key}"),
            Self::Socket(addr) => write!(f, "{addr}"),
        }
    }
}

/// Address variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// [`Address::Peer`]
    Peer,
    /// [`Address::Socket`]
    Socket,
}

/// Payload handed between the application and the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    /// Type name checked against the serialization allow-lists
    pub type_name: String,
    /// Opaque payload
    pub payload: Bytes,
}

impl AppMessage {
    /// Create a message.
    pub fn new(type_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }
}

/// A message at some stage of processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw UDP datagram
    Datagram(Bytes),
    /// Partially decoded envelope
    Envelope(RemoteEnvelope),
    /// Application payload
    Application(AppMessage),
}

impl Message {
    /// Tag of this message variant.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Datagram(_) => MessageKind::Datagram,
            Self::Envelope(_) => MessageKind::Envelope,
            Self::Application(_) => MessageKind::Application,
        }
    }
}

/// Message variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`Message::Datagram`]
    Datagram,
    /// [`Message::Envelope`]
    Envelope,
    /// [`Message::Application`]
    Application,
}

/// Node and peer lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Node started
    NodeUp {
        /// Local listen address, if bound
        address: Option<SocketAddr>,
    },
    /// Node is shutting down
    NodeDown,
    /// Node failed and cannot continue
    NodeUnrecoverableError {
        /// Failure description
        reason: String,
    },
    /// First super peer became reachable
    NodeOnline,
    /// Last super peer was lost
    NodeOffline,
    /// A peer gained its first direct path
    PeerDirect {
        /// The peer
        peer: IdentityPublicKey,
    },
    /// A peer lost its last direct path
    PeerRelay {
        /// The peer
        peer: IdentityPublicKey,
    },
    /// Application message delivered to this node
    MessageReceived {
        /// Sender
        sender: Address,
        /// The message
        message: AppMessage,
    },
}
