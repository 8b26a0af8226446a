//! Configured routes to fixed addresses.

use std::collections::HashMap;
use std::net::SocketAddr;

use skein_crypto::IdentityPublicKey;
use tracing::trace;

use crate::error::HandlerResult;
use crate::message::{Address, Event, Message};
use crate::peers::PathId;
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};

/// Path id under which static routes are registered.
pub const STATIC_ROUTES_PATH: PathId = "static-routes";

/// Routes envelopes for configured keys straight to their address.
///
/// The routes count as direct paths while the node is up.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutes {
    routes: HashMap<IdentityPublicKey, SocketAddr>,
}

impl StaticRoutes {
    /// Create the stage from a route table.
    #[must_use]
    pub fn new(routes: HashMap<IdentityPublicKey, SocketAddr>) -> Self {
        Self { routes }
    }

    /// Address configured for `key`.
    #[must_use]
    pub fn route(&self, key: &IdentityPublicKey) -> Option<SocketAddr> {
        self.routes.get(key).copied()
    }
}

impl Handler for StaticRoutes {
    fn mask(&self) -> HandlerMask {
        HandlerMask::EVENT | HandlerMask::WRITE
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => {
                for key in self.routes.keys() {
                    ctx.peers().add_path(*key, STATIC_ROUTES_PATH);
                }
            }
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => {
                for key in self.routes.keys() {
                    ctx.peers().remove_path(key, STATIC_ROUTES_PATH);
                }
            }
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
        let routed = match (&recipient, &msg) {
            (Address::Peer(key), Message::Envelope(_)) => self.route(key),
            _ => None,
        };
        match routed {
            Some(address) => {
                trace!(%recipient, %address, "using static route");
                ctx.pass_outbound(Address::Socket(address), msg, done);
            }
            None => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}
