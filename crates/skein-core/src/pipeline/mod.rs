//! Handler pipeline.
//!
//! A pipeline is an ordered, mutable chain of named [`Handler`]s between a
//! head sentinel (the network side) and a tail sentinel (the application
//! side). Inbound messages and events enter at the head and travel towards
//! the tail; outbound messages enter at the tail and travel towards the
//! head.
//!
//! ```text
//!  network                                                  application
//!   HEAD <-> codec <-> chunking <-> ... <-> discovery <-> ... <-> TAIL
//!        ---- inbound: process_inbound / process_event ---->
//!        <--------------- outbound: process_outbound -------
//! ```
//!
//! Every operation returns a [`CompletionHandle`] resolved by the stage that
//! ends the operation. Outbound operations can be bounded by an in-flight
//! budget; when it is exhausted `process_outbound` fails immediately with
//! [`PipelineError::CapacityExceeded`].

mod completion;
mod context;
mod executor;
mod handler;
mod simple;

pub use completion::{Completer, CompletionHandle, Outcome};
pub use context::{HandlerContext, WeakHandlerContext};
pub use executor::Executors;
pub use handler::{Handler, HandlerMask};
pub use simple::SimpleHandler;

use std::sync::{Arc, RwLock};

use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::error::{HandlerError, HandlerResult, PipelineError};
use crate::handler::serializer::Serialization;
use crate::identity::Identity;
use crate::message::{Address, Event, Message};
use crate::peers::PeersManager;
use context::{Chain, HEAD, Position, Shared, TAIL};

/// Consumer of events and messages that reach the application.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Read-only services every context exposes to its handler.
#[derive(Clone)]
pub struct Services {
    config: Arc<NodeConfig>,
    identity: Arc<Identity>,
    peers: Arc<PeersManager>,
    executors: Executors,
    inbound_serialization: Arc<Serialization>,
    outbound_serialization: Arc<Serialization>,
    events: EventSink,
}

impl Services {
    /// Bundle the services for a pipeline. The peers manager reports to the
    /// same sink as the pipeline tail.
    #[must_use]
    pub fn new(
        config: Arc<NodeConfig>,
        identity: Arc<Identity>,
        executors: Executors,
        events: EventSink,
    ) -> Self {
        let inbound_serialization = Arc::new(Serialization::new(&config.serialization.inbound));
        let outbound_serialization = Arc::new(Serialization::new(&config.serialization.outbound));
        Self {
            peers: Arc::new(PeersManager::new(events.clone())),
            config,
            identity,
            executors,
            inbound_serialization,
            outbound_serialization,
            events,
        }
    }

    /// Routing registry.
    #[must_use]
    pub fn peers(&self) -> &Arc<PeersManager> {
        &self.peers
    }
}

/// Network end of the chain. Outbound messages reaching it were not
/// written by any stage.
struct HeadHandler;

impl Handler for HeadHandler {
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
        trace!(%recipient, kind = ?msg.kind(), "outbound message reached pipeline head");
        done.fail(PipelineError::Unroutable);
        Ok(())
    }
}

/// Application end of the chain.
struct TailHandler {
    events: EventSink,
}

impl Handler for TailHandler {
    fn mask(&self) -> HandlerMask {
        HandlerMask::INBOUND
    }

    fn on_inbound(
        &self,
        _ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match msg {
            Message::Application(message) => {
                (self.events)(Event::MessageReceived { sender, message });
            }
            other => debug!(%sender, kind = ?other.kind(), "unhandled inbound message dropped"),
        }
        done.complete();
        Ok(())
    }

    fn on_event(&self, _ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        (self.events)(event);
        done.complete();
        Ok(())
    }

    fn on_exception(&self, _ctx: &HandlerContext, error: HandlerError) {
        warn!("unhandled pipeline exception: {error}");
    }
}

/// Ordered chain of handlers with backpressure on outbound writes.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .finish()
    }
}

impl Pipeline {
    /// Create an empty pipeline. The outbound budget is taken from
    /// `message.buffer_size` (0 = unbounded).
    #[must_use]
    pub fn new(services: Services) -> Self {
        let tail = Arc::new(TailHandler {
            events: services.events.clone(),
        });
        let buffer = services.config.message.buffer_size;
        let shared = Arc::new(Shared {
            chain: RwLock::new(Chain::new(Arc::new(HeadHandler), tail)),
            permits: (buffer > 0).then(|| Arc::new(Semaphore::new(buffer))),
            services,
        });
        Self::from_shared(shared)
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Services exposed to handlers.
    #[must_use]
    pub fn services(&self) -> &Services {
        &self.shared.services
    }

    fn insert(
        &self,
        position: Position<'_>,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&Self, PipelineError> {
        let index = self.shared.write().insert(position, name, handler.clone())?;
        self.added(index, &handler);
        Ok(self)
    }

    fn added(&self, index: usize, handler: &Arc<dyn Handler>) {
        let ctx = HandlerContext::new(self.shared.clone(), index);
        if let Err(err) = handler.on_added(&ctx) {
            warn!(handler = ctx.name(), "handler failed on add: {err}");
            ctx.pass_exception(err);
        }
    }

    fn removed(&self, index: usize, handler: &Arc<dyn Handler>) {
        let ctx = HandlerContext::new(self.shared.clone(), index);
        if let Err(err) = handler.on_removed(&ctx) {
            warn!(handler = ctx.name(), "handler failed on remove: {err}");
            ctx.pass_exception(err);
        }
    }

    /// Insert a handler right after the head.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateName`] if `name` is taken.
    pub fn add_first(&self, name: &str, handler: Arc<dyn Handler>) -> Result<&Self, PipelineError> {
        self.insert(Position::First, name, handler)
    }

    /// Insert a handler right before the tail.
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateName`] if `name` is taken.
    pub fn add_last(&self, name: &str, handler: Arc<dyn Handler>) -> Result<&Self, PipelineError> {
        self.insert(Position::Last, name, handler)
    }

    /// Insert a handler right before `base` (on its network side).
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateName`] if `name` is taken,
    /// [`PipelineError::NoSuchHandler`] if `base` is unknown.
    pub fn add_before(
        &self,
        base: &str,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&Self, PipelineError> {
        self.insert(Position::Before(base), name, handler)
    }

    /// Insert a handler right after `base` (on its application side).
    ///
    /// # Errors
    ///
    /// [`PipelineError::DuplicateName`] if `name` is taken,
    /// [`PipelineError::NoSuchHandler`] if `base` is unknown.
    pub fn add_after(
        &self,
        base: &str,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<&Self, PipelineError> {
        self.insert(Position::After(base), name, handler)
    }

    /// Remove a handler and return it.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NoSuchHandler`] if `name` is unknown.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Handler>, PipelineError> {
        let (index, handler) = self.shared.write().remove(name)?;
        self.removed(index, &handler);
        Ok(handler)
    }

    /// Swap the handler registered as `old_name` for `handler` named
    /// `new_name`, returning the old one.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NoSuchHandler`] if `old_name` is unknown,
    /// [`PipelineError::DuplicateName`] if `new_name` is taken by another
    /// handler.
    pub fn replace(
        &self,
        old_name: &str,
        new_name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<dyn Handler>, PipelineError> {
        let (old_index, old, new_index) =
            self.shared
                .write()
                .replace(old_name, new_name, handler.clone())?;
        self.removed(old_index, &old);
        self.added(new_index, &handler);
        Ok(old)
    }

    /// Handler registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.shared.read().get(name).map(|(_, handler)| handler)
    }

    /// Context of the handler registered under `name`.
    #[must_use]
    pub fn context(&self, name: &str) -> Option<HandlerContext> {
        let index = self.shared.read().get(name).map(|(index, _)| index)?;
        Some(HandlerContext::new(self.shared.clone(), index))
    }

    /// Handler names from head to tail.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.shared.read().names()
    }

    /// Feed a message received from the network.
    pub fn process_inbound(&self, sender: Address, msg: Message) -> CompletionHandle {
        let (done, handle) = Completer::new();
        HandlerContext::new(self.shared.clone(), HEAD).pass_inbound(sender, msg, done);
        handle
    }

    /// Feed an event.
    pub fn process_event(&self, event: Event) -> CompletionHandle {
        let (done, handle) = Completer::new();
        HandlerContext::new(self.shared.clone(), HEAD).pass_event(event, done);
        handle
    }

    /// Send a message towards the network.
    ///
    /// Fails immediately with [`PipelineError::CapacityExceeded`] when the
    /// outbound budget is exhausted; the budget slot is returned when the
    /// handle resolves.
    pub fn process_outbound(&self, recipient: Address, msg: Message) -> CompletionHandle {
        let (done, handle) = Completer::new();
        if let Some(semaphore) = &self.shared.permits {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => done.attach_permit(permit),
                Err(_) => {
                    done.fail(PipelineError::CapacityExceeded {
                        capacity: self.shared.services.config.message.buffer_size,
                    });
                    return handle;
                }
            }
        }
        HandlerContext::new(self.shared.clone(), TAIL).pass_outbound(recipient, msg, done);
        handle
    }

    /// Whether an outbound write would currently be accepted.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.messages_before_unwritable() > 0
    }

    /// Outbound writes accepted before the budget is exhausted.
    #[must_use]
    pub fn messages_before_unwritable(&self) -> usize {
        self.shared
            .permits
            .as_ref()
            .map_or(usize::MAX, |semaphore| semaphore.available_permits())
    }
}
