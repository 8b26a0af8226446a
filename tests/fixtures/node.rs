//! Nodes on a [`MemoryNetwork`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use skein_core::config::Endpoint;
use skein_core::{AppMessage, Event, EventSink, Executors, Identity, NodeConfig};
use skein_crypto::IdentityPublicKey;
use skein_node::Node;

use super::MemoryNetwork;

/// Node configuration for tests: no proof of work to compute.
#[must_use]
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.discovery.proof_of_work_difficulty = 0;
    config
}

/// A node on a memory network and the events it emitted.
pub struct TestNode {
    /// The node
    pub node: Node,
    /// Where the node is attached
    pub address: SocketAddr,
    events: Arc<Mutex<Vec<Event>>>,
}

impl TestNode {
    /// Attach a node to `network`, running all stages on the current runtime.
    pub fn spawn(network: &MemoryNetwork, config: NodeConfig, firewalled: bool) -> anyhow::Result<Self> {
        let transport = if firewalled {
            network.attach_firewalled()
        } else {
            network.attach()
        };
        let address = skein_transport::Transport::local_addr(&transport)?;
        let events: Arc<Mutex<Vec<Event>>> = Arc::default();
        let sink = events.clone();
        let sink: EventSink = Arc::new(move |event| {
            if let Ok(mut events) = sink.lock() {
                events.push(event);
            }
        });
        let identity = Identity::generate(config.discovery.proof_of_work_difficulty);
        let node = Node::with_executors(
            config,
            identity,
            Arc::new(transport),
            sink,
            Executors::current().context("no tokio runtime")?,
        )?;
        Ok(Self {
            node,
            address,
            events,
        })
    }

    /// Public key of the node.
    #[must_use]
    pub fn key(&self) -> IdentityPublicKey {
        self.node.identity().public_key()
    }

    /// This node as a super peer entry for other configurations.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.address,
            public_key: self.key(),
        }
    }

    /// Events emitted so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Application messages delivered so far.
    #[must_use]
    pub fn received(&self) -> Vec<AppMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::MessageReceived { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Wait until an emitted event matches `predicate`.
    pub async fn wait_for(
        &self,
        within: Duration,
        predicate: impl Fn(&Event) -> bool,
    ) -> anyhow::Result<()> {
        let waited = tokio::time::timeout(within, async {
            while !self.events().iter().any(&predicate) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if waited.is_err() {
            bail!("no matching event within {within:?}, got {:?}", self.events());
        }
        Ok(())
    }

    /// Wait until an application message with `payload` was delivered.
    pub async fn wait_for_payload(&self, within: Duration, payload: &[u8]) -> anyhow::Result<()> {
        self.wait_for(within, |event| {
            matches!(event, Event::MessageReceived { message, .. } if message.payload == payload)
        })
        .await
    }
}
