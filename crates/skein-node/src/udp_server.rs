//! Network end of the pipeline.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use skein_core::{
    Address, Completer, Event, Handler, HandlerContext, HandlerError, HandlerMask, HandlerResult,
    Message, WeakHandlerContext,
};
use skein_transport::{Transport, TransportError};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Writes outbound datagrams to a [`Transport`] and feeds received datagrams
/// into the pipeline.
///
/// The receive loop waits on the socket on the independent executor
/// between `NodeUp` and `NodeDown`; each datagram is processed on the
/// dependent executor.
pub struct UdpServer {
    transport: Arc<dyn Transport>,
    max_datagram_size: usize,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpServer {
    /// Create the stage around a bound transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, max_datagram_size: usize) -> Self {
        Self {
            transport,
            max_datagram_size,
            receiver: Mutex::new(None),
        }
    }

    /// Whether the receive loop is running.
    #[must_use]
    pub fn is_receiving(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|receiver| !receiver.is_finished())
    }

    fn start_receiving(&self, ctx: &HandlerContext) {
        let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        if receiver.is_some() {
            return;
        }
        debug!(local = ?self.transport.local_addr().ok(), "starting udp receive loop");
        *receiver = Some(ctx.executors().spawn_independent(receive_loop(
            self.transport.clone(),
            ctx.downgrade(),
            self.max_datagram_size,
            OnFailure::Unrecoverable,
        )));
    }

    fn stop_receiving(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            debug!("stopping udp receive loop");
            receiver.abort();
        }
    }
}

/// What a receive loop does when its socket fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnFailure {
    /// Report `NodeUnrecoverableError` through the pipeline.
    Unrecoverable,
    /// Log and end the loop; the node keeps running.
    Stop,
}

/// Read datagrams until the transport closes or the pipeline is dropped.
///
/// Only the socket wait happens on the calling task; every datagram is
/// handed to the dependent executor before a stage sees it.
pub(crate) async fn receive_loop(
    transport: Arc<dyn Transport>,
    ctx: WeakHandlerContext,
    max_datagram_size: usize,
    on_failure: OnFailure,
) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let received = transport.recv_from(&mut buf).await;
        let Some(ctx) = ctx.upgrade() else {
            debug!("pipeline gone, receive loop ends");
            return;
        };
        match received {
            Ok((size, from)) => {
                trace!(%from, size, "datagram received");
                let datagram = Bytes::copy_from_slice(&buf[..size]);
                let pipeline = ctx.pipeline();
                ctx.executors().spawn_dependent(async move {
                    // Inbound outcomes are logged by the stage that drops them.
                    drop(pipeline.process_inbound(Address::Socket(from), Message::Datagram(datagram)));
                });
            }
            Err(TransportError::Closed) => {
                debug!("transport closed, receive loop ends");
                return;
            }
            Err(err) if err.is_transient() => debug!("receive failed: {err}"),
            Err(err) if on_failure == OnFailure::Stop => {
                warn!("receive failed, receive loop ends: {err}");
                return;
            }
            Err(err) => {
                error!("receive failed: {err}");
                let reason = err.to_string();
                let pipeline = ctx.pipeline();
                ctx.executors().spawn_dependent(async move {
                    drop(pipeline.process_event(Event::NodeUnrecoverableError { reason }));
                });
                return;
            }
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.stop_receiving();
    }
}

impl Handler for UdpServer {
    fn mask(&self) -> HandlerMask {
        HandlerMask::EVENT | HandlerMask::WRITE
    }

    fn on_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        self.stop_receiving();
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => self.start_receiving(ctx),
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => self.stop_receiving(),
            _ => {}
        }
        ctx.pass_event(event, done);
        Ok(())
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let (address, datagram) = match (recipient, msg) {
            (Address::Socket(address), Message::Datagram(datagram)) => (address, datagram),
            (recipient, msg) => {
                ctx.pass_outbound(recipient, msg, done);
                return Ok(());
            }
        };
        let transport = self.transport.clone();
        ctx.executors().spawn_dependent(async move {
            match transport.send_to(&datagram, address).await {
                Ok(sent) => {
                    trace!(%address, sent, "datagram sent");
                    done.complete();
                }
                Err(err) => {
                    debug!(%address, "send failed: {err}");
                    done.fail(HandlerError::Transport(err.to_string().into()));
                }
            }
        });
        Ok(())
    }
}
