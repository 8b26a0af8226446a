//! Handler trait and dispatch masks.

use std::fmt;
use std::ops::BitOr;

use super::{Completer, HandlerContext};
use crate::error::{HandlerError, HandlerResult};
use crate::message::{Address, Event, Message};

/// Set of callbacks a handler actually implements.
///
/// Dispatch skips a handler for every callback missing from its mask, so a
/// pure pass-through costs nothing. The mask is read once when the handler
/// is added to a pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerMask(u8);

impl HandlerMask {
    /// No callbacks
    pub const NONE: Self = Self(0);
    /// Inbound messages
    pub const READ: Self = Self(1);
    /// Outbound messages
    pub const WRITE: Self = Self(1 << 1);
    /// Events
    pub const EVENT: Self = Self(1 << 2);
    /// Exceptions
    pub const EXCEPTION: Self = Self(1 << 3);
    /// Everything travelling towards the application
    pub const INBOUND: Self = Self(Self::READ.0 | Self::EVENT.0 | Self::EXCEPTION.0);
    /// Everything travelling towards the network
    pub const OUTBOUND: Self = Self::WRITE;
    /// Both directions
    pub const DUPLEX: Self = Self(Self::INBOUND.0 | Self::OUTBOUND.0);

    /// Whether all callbacks in `other` are part of this mask.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HandlerMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for HandlerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::EVENT, "EVENT"),
            (Self::EXCEPTION, "EXCEPTION"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "HandlerMask({})", set.join("|"))
    }
}

/// One processing stage of a pipeline.
///
/// Every callback defaults to passing its input on unchanged. A handler
/// ends an operation by resolving the [`Completer`] it receives, or passes
/// the completer on together with the (possibly transformed) message.
/// Returning an error fails the operation unless it was already resolved
/// and starts an exception dispatch at the next stage.
pub trait Handler: Send + Sync + 'static {
    /// Callbacks this handler implements.
    fn mask(&self) -> HandlerMask;

    /// Called after the handler was added to a pipeline.
    fn on_added(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    /// Called after the handler was removed from a pipeline.
    fn on_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    /// Message travelling towards the application.
    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        ctx.pass_inbound(sender, msg, done);
        Ok(())
    }

    /// Event travelling towards the application.
    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        ctx.pass_event(event, done);
        Ok(())
    }

    /// Error raised by an earlier stage.
    fn on_exception(&self, ctx: &HandlerContext, error: HandlerError) {
        ctx.pass_exception(error);
    }

    /// Message travelling towards the network.
    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        ctx.pass_outbound(recipient, msg, done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_composition() {
        let mask = HandlerMask::READ | HandlerMask::WRITE;
        assert!(mask.contains(HandlerMask::READ));
        assert!(mask.contains(HandlerMask::WRITE));
        assert!(!mask.contains(HandlerMask::EVENT));
        assert!(HandlerMask::DUPLEX.contains(HandlerMask::INBOUND));
        assert!(HandlerMask::NONE.contains(HandlerMask::NONE));
        assert_eq!(format!("{mask:?}"), "HandlerMask(READ|WRITE)");
    }
}
