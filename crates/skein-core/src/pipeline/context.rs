//! Handler contexts and the chain they form.
//!
//! Contexts live in an arena indexed by slot numbers. Slot 0 is the head
//! sentinel (network side), slot 1 the tail sentinel (application side).
//! Structural edits relink `prev`/`next` links under the chain's write
//! lock.
//!
//! A removed slot keeps its links, so a dispatch that is currently inside
//! the removed handler still finds a path forward. The slot goes on a free
//! list and is handed to a later insert once nothing outside the chain
//! holds its handler. Every reuse bumps the slot's generation; links and
//! contexts carry the generation they were made for, and a pass that runs
//! into a reused slot through a stale link is detached instead of landing
//! in the wrong handler.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, warn};

use super::{Completer, Handler, HandlerMask, Pipeline, Services};
use crate::config::NodeConfig;
use crate::error::{HandlerError, PipelineError};
use crate::handler::serializer::Serialization;
use crate::identity::Identity;
use crate::message::{Address, Event, Message};
use crate::peers::PeersManager;
use crate::pipeline::Executors;

pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    index: usize,
    generation: u64,
}

impl Link {
    fn sentinel(index: usize) -> Self {
        Self {
            index,
            generation: 0,
        }
    }
}

pub(crate) struct Slot {
    name: Arc<str>,
    handler: Arc<dyn Handler>,
    mask: HandlerMask,
    generation: u64,
    prev: Link,
    next: Option<Link>,
    removed: bool,
}

pub(crate) struct Chain {
    slots: Vec<Slot>,
    names: HashMap<Arc<str>, usize>,
    free: Vec<usize>,
}

/// Where a pass continues.
enum Next {
    Handler(Link, Arc<str>, Arc<dyn Handler>),
    End,
    /// The context's slot, or a slot on its stale path, was reused.
    Detached,
}

/// Where to insert a new context.
pub(crate) enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

impl Chain {
    pub(crate) fn new(head: Arc<dyn Handler>, tail: Arc<dyn Handler>) -> Self {
        let head_mask = head.mask();
        let tail_mask = tail.mask();
        Self {
            slots: vec![
                Slot {
                    name: Arc::from("HEAD"),
                    handler: head,
                    mask: head_mask,
                    generation: 0,
                    prev: Link::sentinel(HEAD),
                    next: Some(Link::sentinel(TAIL)),
                    removed: false,
                },
                Slot {
                    name: Arc::from("TAIL"),
                    handler: tail,
                    mask: tail_mask,
                    generation: 0,
                    prev: Link::sentinel(HEAD),
                    next: None,
                    removed: false,
                },
            ],
            names: HashMap::new(),
            free: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Result<usize, PipelineError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::NoSuchHandler(name.to_string()))
    }

    fn link_to(&self, index: usize) -> Link {
        Link {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn is_current(&self, link: Link) -> bool {
        self.slots[link.index].generation == link.generation
    }

    /// A removed slot whose handler no dispatch or caller holds anymore.
    fn take_free(&mut self) -> Option<usize> {
        let position = self
            .free
            .iter()
            .position(|&index| Arc::strong_count(&self.slots[index].handler) == 1)?;
        Some(self.free.swap_remove(position))
    }

    fn link(&mut self, name: Arc<str>, handler: Arc<dyn Handler>, prev: usize, next: usize) -> usize {
        let (index, generation) = match self.take_free() {
            Some(index) => (index, self.slots[index].generation.wrapping_add(1)),
            None => (self.slots.len(), 0),
        };
        let slot = Slot {
            name: name.clone(),
            mask: handler.mask(),
            handler,
            generation,
            prev: self.link_to(prev),
            next: Some(self.link_to(next)),
            removed: false,
        };
        if index == self.slots.len() {
            self.slots.push(slot);
        } else {
            self.slots[index] = slot;
        }
        let this = Link { index, generation };
        self.slots[prev].next = Some(this);
        self.slots[next].prev = this;
        self.names.insert(name, index);
        index
    }

    fn unlink(&mut self, index: usize) {
        let prev = self.slots[index].prev;
        let next = self.slots[index].next;
        self.slots[prev.index].next = next;
        if let Some(next) = next {
            self.slots[next.index].prev = prev;
        }
        self.slots[index].removed = true;
        let name = self.slots[index].name.clone();
        self.names.remove(&name);
        self.free.push(index);
    }

    pub(crate) fn insert(
        &mut self,
        position: Position<'_>,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<usize, PipelineError> {
        if self.names.contains_key(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        let after = |slot: &Slot| slot.next.map_or(TAIL, |next| next.index);
        let (prev, next) = match position {
            Position::First => (HEAD, after(&self.slots[HEAD])),
            Position::Last => (self.slots[TAIL].prev.index, TAIL),
            Position::Before(base) => {
                let base = self.lookup(base)?;
                (self.slots[base].prev.index, base)
            }
            Position::After(base) => {
                let base = self.lookup(base)?;
                (base, after(&self.slots[base]))
            }
        };
        Ok(self.link(Arc::from(name), handler, prev, next))
    }

    pub(crate) fn remove(&mut self, name: &str) -> Result<(usize, Arc<dyn Handler>), PipelineError> {
        let index = self.lookup(name)?;
        self.unlink(index);
        Ok((index, self.slots[index].handler.clone()))
    }

    pub(crate) fn replace(
        &mut self,
        old_name: &str,
        new_name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(usize, Arc<dyn Handler>, usize), PipelineError> {
        let old = self.lookup(old_name)?;
        if old_name != new_name && self.names.contains_key(new_name) {
            return Err(PipelineError::DuplicateName(new_name.to_string()));
        }
        // Holding the old handler keeps its slot off the free list below.
        let old_handler = self.slots[old].handler.clone();
        let prev = self.slots[old].prev.index;
        let next = self.slots[old].next.map_or(TAIL, |next| next.index);
        self.unlink(old);
        let new = self.link(Arc::from(new_name), handler, prev, next);
        Ok((old, old_handler, new))
    }

    pub(crate) fn get(&self, name: &str) -> Option<(usize, Arc<dyn Handler>)> {
        let index = *self.names.get(name)?;
        Some((index, self.slots[index].handler.clone()))
    }

    /// Slots ever allocated, sentinels included.
    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Names from head to tail, sentinels excluded.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = self.slots[HEAD].next;
        while let Some(link) = cursor {
            if link.index == TAIL {
                break;
            }
            names.push(self.slots[link.index].name.to_string());
            cursor = self.slots[link.index].next;
        }
        names
    }

    fn found(&self, link: Link) -> Next {
        let slot = &self.slots[link.index];
        Next::Handler(link, slot.name.clone(), slot.handler.clone())
    }

    fn next_matching(&self, from: Link, mask: HandlerMask) -> Next {
        if !self.is_current(from) {
            return Next::Detached;
        }
        let mut cursor = self.slots[from.index].next;
        while let Some(link) = cursor {
            if !self.is_current(link) {
                return Next::Detached;
            }
            let slot = &self.slots[link.index];
            if !slot.removed && slot.mask.contains(mask) {
                return self.found(link);
            }
            cursor = slot.next;
        }
        Next::End
    }

    fn prev_matching(&self, from: Link, mask: HandlerMask) -> Next {
        if !self.is_current(from) {
            return Next::Detached;
        }
        if from.index == HEAD {
            return Next::End;
        }
        let mut link = self.slots[from.index].prev;
        loop {
            if !self.is_current(link) {
                return Next::Detached;
            }
            let slot = &self.slots[link.index];
            if !slot.removed && slot.mask.contains(mask) {
                return self.found(link);
            }
            if link.index == HEAD {
                return Next::End;
            }
            link = slot.prev;
        }
    }
}

/// State shared by a pipeline and all of its contexts.
pub(crate) struct Shared {
    pub(crate) chain: RwLock<Chain>,
    pub(crate) services: Services,
    pub(crate) permits: Option<Arc<tokio::sync::Semaphore>>,
}

impl Shared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Chain> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Chain> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A handler's view of its pipeline.
///
/// Contexts are cheap to clone and stay valid after their handler was
/// removed; passing from a removed context continues along the links the
/// context had when it was removed. Once the removed slot is reused, the
/// context is detached: operations passed through it fail with
/// [`PipelineError::NoSuchHandler`].
#[derive(Clone)]
pub struct HandlerContext {
    shared: Arc<Shared>,
    slot: Link,
    name: Arc<str>,
}

/// A [`HandlerContext`] that does not keep its pipeline alive.
///
/// Long-running tasks of a stage hold one, so dropping the last handle to
/// a pipeline drops its stages, which stop their tasks.
#[derive(Clone, Debug)]
pub struct WeakHandlerContext {
    shared: Weak<Shared>,
    slot: Link,
    name: Arc<str>,
}

impl WeakHandlerContext {
    /// The context, if its pipeline still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<HandlerContext> {
        Some(HandlerContext {
            shared: self.shared.upgrade()?,
            slot: self.slot,
            name: self.name.clone(),
        })
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("name", &self.name)
            .field("index", &self.slot.index)
            .finish()
    }
}

impl HandlerContext {
    pub(crate) fn new(shared: Arc<Shared>, index: usize) -> Self {
        let (slot, name) = {
            let chain = shared.read();
            (chain.link_to(index), chain.slots[index].name.clone())
        };
        Self { shared, slot, name }
    }

    /// A handle to this context that does not keep the pipeline alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakHandlerContext {
        WeakHandlerContext {
            shared: Arc::downgrade(&self.shared),
            slot: self.slot,
            name: self.name.clone(),
        }
    }

    /// Name the handler was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.shared.services.config
    }

    /// Local identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.shared.services.identity
    }

    /// Routing registry.
    #[must_use]
    pub fn peers(&self) -> &Arc<PeersManager> {
        &self.shared.services.peers
    }

    /// Executors for asynchronous work.
    #[must_use]
    pub fn executors(&self) -> &Executors {
        &self.shared.services.executors
    }

    /// Allow-list for application types arriving from the network.
    #[must_use]
    pub fn inbound_serialization(&self) -> &Serialization {
        &self.shared.services.inbound_serialization
    }

    /// Allow-list for application types sent by the application.
    #[must_use]
    pub fn outbound_serialization(&self) -> &Serialization {
        &self.shared.services.outbound_serialization
    }

    /// The pipeline this context belongs to.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::from_shared(self.shared.clone())
    }

    fn at(&self, slot: Link, name: Arc<str>) -> Self {
        Self {
            shared: self.shared.clone(),
            slot,
            name,
        }
    }

    fn detached(&self, done: Completer) {
        debug!(handler = %self.name, "context detached from its pipeline, dropping operation");
        done.fail(PipelineError::NoSuchHandler(self.name.to_string()));
    }

    fn caught(&self, direction: &'static str, done_guard: super::completion::CompletionGuard, err: HandlerError) {
        warn!(handler = %self.name, direction, "handler failed: {err}");
        done_guard.fail(err.clone());
        self.pass_exception(err);
    }

    /// Hand an inbound message to the next stage towards the application.
    pub fn pass_inbound(&self, sender: Address, msg: Message, done: Completer) {
        let next = self.shared.read().next_matching(self.slot, HandlerMask::READ);
        match next {
            Next::Handler(slot, name, handler) => {
                let ctx = self.at(slot, name);
                let guard = done.guard();
                if let Err(err) = handler.on_inbound(&ctx, sender, msg, done) {
                    ctx.caught("inbound", guard, err);
                }
            }
            Next::End => done.complete(),
            Next::Detached => self.detached(done),
        }
    }

    /// Hand an event to the next stage towards the application.
    pub fn pass_event(&self, event: Event, done: Completer) {
        let next = self.shared.read().next_matching(self.slot, HandlerMask::EVENT);
        match next {
            Next::Handler(slot, name, handler) => {
                let ctx = self.at(slot, name);
                let guard = done.guard();
                if let Err(err) = handler.on_event(&ctx, event, done) {
                    ctx.caught("event", guard, err);
                }
            }
            Next::End => done.complete(),
            Next::Detached => self.detached(done),
        }
    }

    /// Hand an error to the next stage towards the application.
    pub fn pass_exception(&self, error: HandlerError) {
        let next = self
            .shared
            .read()
            .next_matching(self.slot, HandlerMask::EXCEPTION);
        match next {
            Next::Handler(slot, name, handler) => handler.on_exception(&self.at(slot, name), error),
            Next::End => {}
            Next::Detached => debug!(handler = %self.name, "context detached, dropping error: {error}"),
        }
    }

    /// Hand an outbound message to the next stage towards the network.
    pub fn pass_outbound(&self, recipient: Address, msg: Message, done: Completer) {
        let prev = self.shared.read().prev_matching(self.slot, HandlerMask::WRITE);
        match prev {
            Next::Handler(slot, name, handler) => {
                let ctx = self.at(slot, name);
                let guard = done.guard();
                if let Err(err) = handler.on_outbound(&ctx, recipient, msg, done) {
                    ctx.caught("outbound", guard, err);
                }
            }
            Next::End => done.fail(PipelineError::Unroutable),
            Next::Detached => self.detached(done),
        }
    }
}
