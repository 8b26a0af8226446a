//! Node implementation - composes and drives the pipeline
//!
//! A [`Node`] owns the pipeline, the transport and the runtime the
//! independent stages run on. Application messages go in through
//! [`Node::send`]; delivered messages and lifecycle changes come out through
//! the [`EventSink`] given at construction.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use skein_core::{EventSink, Identity, NodeConfig};
//! use skein_node::Node;
//! use skein_transport::AsyncUdpTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::default();
//!     let identity = Identity::generate(config.discovery.proof_of_work_difficulty);
//!     let transport = AsyncUdpTransport::bind(config.listen_addr).await?;
//!     let events: EventSink = Arc::new(|event| println!("{event:?}"));
//!
//!     let node = Node::new(config, identity, Arc::new(transport), events)?;
//!     node.start().await?;
//!     // ...
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use skein_core::config::MessageConfig;
use skein_core::handler::{
    ArmHandler, ChunkingHandler, EnvelopeCodec, HopCountGuard, InvalidProofOfWorkFilter,
    MessageSerializer, OtherNetworkFilter, RateLimiter, StaticRoutes, loopback,
};
use skein_core::{
    Address, AppMessage, CompletionHandle, Event, EventSink, Executors, Identity, Message,
    NodeConfig, Pipeline, Services,
};
use skein_crypto::{IdentityPublicKey, LongTimeArmor};
use skein_discovery::{InternetDiscovery, LocalHostDiscovery, LocalNetworkDiscovery};
use skein_transport::{Transport, TransportConfig};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::udp_multicast_server::UdpMulticastServer;
use crate::udp_server::UdpServer;

/// Stage names in pipeline order, network end first.
pub mod stages {
    /// [`crate::UdpServer`]
    pub const UDP_SERVER: &str = "udp-server";
    /// [`crate::UdpMulticastServer`]
    pub const UDP_MULTICAST_SERVER: &str = "udp-multicast-server";
    /// Envelope encoding and partial decoding
    pub const ENVELOPE_CODEC: &str = "envelope-codec";
    /// Chunking and reassembly
    pub const CHUNKING: &str = "chunking";
    /// Drops envelopes of other networks
    pub const OTHER_NETWORK_FILTER: &str = "other-network-filter";
    /// Drops envelopes with an invalid proof of work
    pub const PROOF_OF_WORK_FILTER: &str = "proof-of-work-filter";
    /// Body encryption
    pub const ARM: &str = "arm";
    /// Control message rate limit
    pub const RATE_LIMITER: &str = "rate-limiter";
    /// Hop limit enforcement
    pub const HOP_COUNT_GUARD: &str = "hop-count-guard";
    /// Peer discovery and NAT traversal
    pub const INTERNET_DISCOVERY: &str = skein_discovery::INTERNET_DISCOVERY_PATH;
    /// Multicast discovery on the local network
    pub const LOCAL_NETWORK_DISCOVERY: &str = skein_discovery::LOCAL_NETWORK_DISCOVERY_PATH;
    /// Discovery through a directory shared on this host
    pub const LOCAL_HOST_DISCOVERY: &str = skein_discovery::LOCAL_HOST_DISCOVERY_PATH;
    /// Configured routes
    pub const STATIC_ROUTES: &str = skein_core::handler::STATIC_ROUTES_PATH;
    /// Application message serialization
    pub const MESSAGE_SERIALIZER: &str = "message-serializer";
    /// Delivery of messages sent to this node
    pub const LOOPBACK: &str = "loopback";
}

const INDEPENDENT_THREAD_NAME: &str = "skein-independent";
const INDEPENDENT_WORKER_THREADS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

struct Inner {
    pipeline: Pipeline,
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    runtime: Mutex<Option<Runtime>>,
    state: Mutex<Lifecycle>,
}

impl Inner {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown_runtime(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            // Dropping a runtime blocks, which panics inside async code.
            runtime.shutdown_background();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown_runtime();
    }
}

/// A skein node.
///
/// Cloning is cheap; clones share the same pipeline and lifecycle. The
/// stages' background tasks hold the pipeline only weakly, so dropping the
/// last clone without [`Node::shutdown`] still ends them.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Create a node on `transport`.
    ///
    /// Dependent work runs on the runtime this is called from; the
    /// independent stages get a dedicated multi-thread runtime.
    ///
    /// # Errors
    ///
    /// - [`NodeError::InvalidConfig`] if `config` fails validation
    /// - [`NodeError::Runtime`] if called outside a tokio runtime or the
    ///   independent runtime cannot be built
    pub fn new(
        config: NodeConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
        events: EventSink,
    ) -> Result<Self> {
        config.validate()?;
        let dependent = Handle::try_current()
            .map_err(|e| NodeError::Runtime(format!("no tokio runtime: {e}").into()))?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(INDEPENDENT_WORKER_THREADS)
            .thread_name(INDEPENDENT_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| NodeError::Runtime(format!("independent runtime: {e}").into()))?;
        let executors = Executors::new(dependent, runtime.handle().clone());
        Self::assemble(config, identity, transport, events, executors, Some(runtime))
    }

    /// Create a node scheduling on the given executors.
    ///
    /// The node owns no runtime then, which lets tests drive all stages on a
    /// single runtime with paused time.
    ///
    /// # Errors
    ///
    /// [`NodeError::InvalidConfig`] if `config` fails validation.
    pub fn with_executors(
        config: NodeConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
        events: EventSink,
        executors: Executors,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, identity, transport, events, executors, None)
    }

    fn assemble(
        config: NodeConfig,
        identity: Identity,
        transport: Arc<dyn Transport>,
        events: EventSink,
        executors: Executors,
        runtime: Option<Runtime>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let identity = Arc::new(identity);
        let pipeline = Pipeline::new(Services::new(
            config.clone(),
            identity.clone(),
            executors,
            events,
        ));
        if let Err(e) = build_pipeline(&pipeline, &config, &identity, transport.clone()) {
            if let Some(runtime) = runtime {
                runtime.shutdown_background();
            }
            return Err(e);
        }
        debug!(stages = ?pipeline.names(), "pipeline assembled");

        Ok(Self {
            inner: Arc::new(Inner {
                pipeline,
                identity,
                transport,
                runtime: Mutex::new(runtime),
                state: Mutex::new(Lifecycle::Created),
            }),
        })
    }

    /// Start receiving and announce `NodeUp` to every stage.
    ///
    /// Starting a running node does nothing.
    ///
    /// # Errors
    ///
    /// - [`NodeError::InvalidState`] if the node was shut down
    /// - [`NodeError::Pipeline`] if a stage fails the `NodeUp` event
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.lifecycle();
            match *state {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopped => return Err(NodeError::invalid_state("node was shut down")),
                Lifecycle::Created => *state = Lifecycle::Running,
            }
        }

        let address = self.inner.transport.local_addr().ok();
        info!(
            identity = %self.identity().public_key(),
            address = ?address,
            "starting node"
        );
        self.inner
            .pipeline
            .process_event(Event::NodeUp { address })
            .await?;
        Ok(())
    }

    /// Announce `NodeDown`, close the transport and stop the independent
    /// runtime.
    ///
    /// Shutting down twice, or a node that never started, does nothing
    /// beyond marking it stopped.
    ///
    /// # Errors
    ///
    /// [`NodeError::Pipeline`] if a stage fails the `NodeDown` event. The
    /// transport and runtime are released regardless.
    pub async fn shutdown(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.inner.lifecycle(), Lifecycle::Stopped);
        if previous != Lifecycle::Running {
            return Ok(());
        }

        info!(identity = %self.identity().public_key(), "shutting down node");
        let result = self.inner.pipeline.process_event(Event::NodeDown).await;
        if let Err(e) = self.inner.transport.close().await {
            warn!("Error closing transport: {e}");
        }
        self.inner.shutdown_runtime();
        result.map_err(NodeError::from)
    }

    /// Send an application message to `recipient`.
    ///
    /// The handle resolves once the message left through the transport, or
    /// with the reason it was dropped.
    pub fn send(
        &self,
        recipient: IdentityPublicKey,
        type_name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> CompletionHandle {
        self.inner.pipeline.process_outbound(
            Address::Peer(recipient),
            Message::Application(AppMessage::new(type_name, payload)),
        )
    }

    /// Identity of this node.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// The pipeline, for inspection and custom stages.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Address the transport is bound to.
    ///
    /// # Errors
    ///
    /// [`NodeError::Transport`] if the transport cannot report it.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Whether the node was started and not yet shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle() == Lifecycle::Running
    }
}

/// Add every stage `config` enables to `pipeline`, network end first.
///
/// # Errors
///
/// [`NodeError::Pipeline`] if `pipeline` already holds a stage of the same
/// name.
pub fn build_pipeline(
    pipeline: &Pipeline,
    config: &NodeConfig,
    identity: &Identity,
    transport: Arc<dyn Transport>,
) -> Result<()> {
    let message: &MessageConfig = &config.message;
    let max_datagram_size = TransportConfig::default().max_datagram_size;

    pipeline.add_last(
        stages::UDP_SERVER,
        Arc::new(UdpServer::new(transport, max_datagram_size)),
    )?;
    if config.local_network_discovery.enabled {
        pipeline.add_last(
            stages::UDP_MULTICAST_SERVER,
            Arc::new(UdpMulticastServer::new(
                &config.local_network_discovery,
                max_datagram_size,
            )),
        )?;
    }
    pipeline
        .add_last(stages::ENVELOPE_CODEC, Arc::new(EnvelopeCodec))?
        .add_last(stages::CHUNKING, Arc::new(ChunkingHandler::new(message)))?
        .add_last(stages::OTHER_NETWORK_FILTER, Arc::new(OtherNetworkFilter))?
        .add_last(
            stages::PROOF_OF_WORK_FILTER,
            Arc::new(InvalidProofOfWorkFilter),
        )?;
    if message.arm_enabled {
        let armor = LongTimeArmor::new(identity.key_pair().clone());
        pipeline.add_last(stages::ARM, Arc::new(ArmHandler::new(Arc::new(armor))))?;
    }
    if config.rate_limit.enabled {
        pipeline.add_last(
            stages::RATE_LIMITER,
            Arc::new(RateLimiter::new(&config.rate_limit)),
        )?;
    }
    pipeline.add_last(stages::HOP_COUNT_GUARD, Arc::new(HopCountGuard))?;
    if config.discovery.enabled {
        pipeline.add_last(
            stages::INTERNET_DISCOVERY,
            Arc::new(InternetDiscovery::new(config)),
        )?;
    }
    if config.local_network_discovery.enabled {
        pipeline.add_last(
            stages::LOCAL_NETWORK_DISCOVERY,
            Arc::new(LocalNetworkDiscovery::new(config)),
        )?;
    }
    if config.local_host_discovery.enabled {
        pipeline.add_last(
            stages::LOCAL_HOST_DISCOVERY,
            Arc::new(LocalHostDiscovery::new(config, identity.public_key())),
        )?;
    }
    pipeline
        .add_last(
            stages::STATIC_ROUTES,
            Arc::new(StaticRoutes::new(config.static_routes.clone())),
        )?
        .add_last(stages::MESSAGE_SERIALIZER, Arc::new(MessageSerializer))?
        .add_last(stages::LOOPBACK, Arc::new(loopback()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use skein_core::PipelineError;
    use skein_transport::AsyncUdpTransport;
    use tokio::time::timeout;

    type Received = Arc<std::sync::Mutex<Vec<Event>>>;

    fn recording_sink() -> (EventSink, Received) {
        let events: Received = Arc::default();
        let sink = events.clone();
        (
            Arc::new(move |event| sink.lock().unwrap().push(event)),
            events,
        )
    }

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.discovery.proof_of_work_difficulty = 0;
        config
    }

    async fn node(config: NodeConfig) -> (Node, Received) {
        let transport = AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap();
        let (sink, events) = recording_sink();
        let node = Node::with_executors(
            config,
            Identity::generate(0),
            Arc::new(transport),
            sink,
            Executors::current().unwrap(),
        )
        .unwrap();
        (node, events)
    }

    #[tokio::test]
    async fn test_canonical_stage_order() {
        let directory = tempfile::TempDir::new().unwrap();
        let mut config = config();
        config.local_network_discovery.enabled = true;
        config.local_host_discovery.enabled = true;
        config.local_host_discovery.path = directory.path().to_path_buf();
        let (node, _) = node(config).await;
        assert_eq!(
            node.pipeline().names(),
            [
                "udp-server",
                "udp-multicast-server",
                "envelope-codec",
                "chunking",
                "other-network-filter",
                "proof-of-work-filter",
                "arm",
                "rate-limiter",
                "hop-count-guard",
                "internet-discovery",
                "local-network-discovery",
                "local-host-discovery",
                "static-routes",
                "message-serializer",
                "loopback",
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_stages_are_left_out() {
        let mut config = config();
        config.message.arm_enabled = false;
        config.rate_limit.enabled = false;
        config.discovery.enabled = false;
        let (node, _) = node(config).await;
        let names = node.pipeline().names();
        for absent in [
            stages::ARM,
            stages::RATE_LIMITER,
            stages::INTERNET_DISCOVERY,
            stages::UDP_MULTICAST_SERVER,
            stages::LOCAL_NETWORK_DISCOVERY,
            stages::LOCAL_HOST_DISCOVERY,
        ] {
            assert!(!names.iter().any(|name| name == absent), "{absent} present");
        }
        assert_eq!(names.len(), 9);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.message.hop_limit = 0;
        let transport = AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap();
        let (sink, _) = recording_sink();
        let result = Node::with_executors(
            config,
            Identity::generate(0),
            Arc::new(transport),
            sink,
            Executors::current().unwrap(),
        );
        assert!(matches!(result, Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let runtime = Builder::new_current_thread().enable_all().build().unwrap();
        let transport = runtime
            .block_on(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)))
            .unwrap();
        let (sink, _) = recording_sink();
        let result = Node::new(config(), Identity::generate(0), Arc::new(transport), sink);
        assert!(matches!(result, Err(NodeError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let (node, _) = node(config()).await;
        assert!(!node.is_running());
        node.start().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());

        node.shutdown().await.unwrap();
        node.shutdown().await.unwrap();
        assert!(!node.is_running());
        assert!(matches!(
            node.start().await,
            Err(NodeError::InvalidState(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_own_runtime_lifecycle() {
        let transport = AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap();
        let local = transport.local_addr().unwrap();
        let (sink, _) = recording_sink();
        let node = Node::new(config(), Identity::generate(0), Arc::new(transport), sink).unwrap();
        assert_eq!(node.local_addr().unwrap(), local);

        node.start().await.unwrap();
        node.shutdown().await.unwrap();
        drop(node);
    }

    #[tokio::test]
    async fn test_dropping_node_stops_its_tasks() {
        let transport = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let (sink, _) = recording_sink();
        let node = Node::with_executors(
            config(),
            Identity::generate(0),
            transport.clone(),
            sink,
            Executors::current().unwrap(),
        )
        .unwrap();
        node.start().await.unwrap();
        assert!(Arc::strong_count(&transport) > 1);

        drop(node);
        timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&transport) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a task still holds the transport");
    }

    #[tokio::test]
    async fn test_local_host_discovery_between_nodes() {
        let directory = tempfile::TempDir::new().unwrap();
        let local_host = |mut config: NodeConfig| {
            config.discovery.enabled = false;
            config.local_host_discovery.enabled = true;
            config.local_host_discovery.path = directory.path().to_path_buf();
            // Rescan every second instead of waiting for the directory watch.
            config.local_host_discovery.watch_enabled = false;
            config.local_host_discovery.lease_time_ms = 6_000;
            config
        };
        let (receiver, received) = node(local_host(config())).await;
        let (sender, _) = node(local_host(config())).await;
        receiver.start().await.unwrap();
        sender.start().await.unwrap();

        let peers = sender.pipeline().services().peers().clone();
        let receiver_key = receiver.identity().public_key();
        timeout(Duration::from_secs(5), async {
            while !peers.has_path(&receiver_key) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("receiver not discovered");

        sender
            .send(receiver_key, "bytes", vec![1u8; 16])
            .await
            .unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                let delivered = received.lock().unwrap().iter().any(|event| matches!(
                    event,
                    Event::MessageReceived { message, .. } if message.payload.len() == 16
                ));
                if delivered {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message not delivered");

        sender.shutdown().await.unwrap();
        receiver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_to_self_is_delivered() {
        let (node, events) = node(config()).await;
        node.start().await.unwrap();

        let me = node.identity().public_key();
        node.send(me, "string", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(events.lock().unwrap().iter().any(|event| matches!(
            event,
            Event::MessageReceived { message, .. } if message.payload == Bytes::from_static(b"hello")
        )));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_over_static_route() {
        let (receiver, received) = node(config()).await;
        let mut sender_config = config();
        sender_config.static_routes.insert(
            receiver.identity().public_key(),
            receiver.local_addr().unwrap(),
        );
        let (sender, _) = node(sender_config).await;
        receiver.start().await.unwrap();
        sender.start().await.unwrap();

        sender
            .send(receiver.identity().public_key(), "bytes", vec![7u8; 3000])
            .await
            .unwrap();
        timeout(Duration::from_secs(2), async {
            loop {
                let delivered = received.lock().unwrap().iter().any(|event| matches!(
                    event,
                    Event::MessageReceived { message, .. } if message.payload.len() == 3000
                ));
                if delivered {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message not delivered");

        sender.shutdown().await.unwrap();
        receiver.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_unroutable() {
        let mut config = config();
        config.discovery.enabled = false;
        let (node, _) = node(config).await;
        node.start().await.unwrap();
        let stranger = Identity::generate(0).public_key();
        assert_eq!(
            node.send(stranger, "bytes", Bytes::new()).await,
            Err(PipelineError::Unroutable)
        );
    }
}
