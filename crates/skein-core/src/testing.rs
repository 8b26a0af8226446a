//! Helpers shared by the unit tests of pipeline stages.

use std::sync::{Arc, Mutex};

use crate::config::NodeConfig;
use crate::error::HandlerResult;
use crate::identity::Identity;
use crate::message::{Address, Event, Message};
use crate::pipeline::{Completer, EventSink, Executors, Handler, HandlerContext, HandlerMask, Pipeline, Services};

/// Records messages reaching it and completes them.
pub(crate) struct Recorder {
    mask: HandlerMask,
    seen: Mutex<Vec<(Address, Message)>>,
}

impl Recorder {
    /// Records outbound messages; place it first.
    pub(crate) fn outbound() -> Arc<Self> {
        Arc::new(Self {
            mask: HandlerMask::WRITE,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Records inbound messages; place it last.
    pub(crate) fn inbound() -> Arc<Self> {
        Arc::new(Self {
            mask: HandlerMask::READ,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn take(&self) -> Vec<(Address, Message)> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

impl Handler for Recorder {
    fn mask(&self) -> HandlerMask {
        self.mask
    }

    fn on_inbound(
        &self,
        _ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        self.seen.lock().unwrap().push((sender, msg));
        done.complete();
        Ok(())
    }

    fn on_outbound(
        &self,
        _ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        self.seen.lock().unwrap().push((recipient, msg));
        done.complete();
        Ok(())
    }
}

/// Pipeline on the current runtime collecting its events.
pub(crate) fn pipeline(config: NodeConfig, identity: Identity) -> (Pipeline, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sink: EventSink = Arc::new(move |event| sink.lock().unwrap().push(event));
    let services = Services::new(
        Arc::new(config),
        Arc::new(identity),
        Executors::current().unwrap(),
        sink,
    );
    (Pipeline::new(services), events)
}
