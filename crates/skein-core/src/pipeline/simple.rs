//! Closure-backed handler.
//!
//! A [`SimpleHandler`] reacts only to messages whose variant and address
//! variant match its predicates and passes everything else through
//! untouched. Useful for small stages and test doubles.

use super::{Completer, Handler, HandlerContext, HandlerMask};
use crate::error::HandlerResult;
use crate::message::{Address, AddressKind, Message, MessageKind};

type Callback = Box<dyn Fn(&HandlerContext, Address, Message, Completer) -> HandlerResult + Send + Sync>;

/// Handler built from predicates and closures.
pub struct SimpleHandler {
    message: Option<MessageKind>,
    address: Option<AddressKind>,
    inbound: Option<Callback>,
    outbound: Option<Callback>,
}

impl SimpleHandler {
    /// Handler reacting to inbound messages.
    pub fn inbound(
        f: impl Fn(&HandlerContext, Address, Message, Completer) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: None,
            address: None,
            inbound: Some(Box::new(f)),
            outbound: None,
        }
    }

    /// Handler reacting to outbound messages.
    pub fn outbound(
        f: impl Fn(&HandlerContext, Address, Message, Completer) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: None,
            address: None,
            inbound: None,
            outbound: Some(Box::new(f)),
        }
    }

    /// Also react to outbound messages.
    #[must_use]
    pub fn with_outbound(
        mut self,
        f: impl Fn(&HandlerContext, Address, Message, Completer) -> HandlerResult + Send + Sync + 'static,
    ) -> Self {
        self.outbound = Some(Box::new(f));
        self
    }

    /// Only react to messages of this variant.
    #[must_use]
    pub fn matching_message(mut self, kind: MessageKind) -> Self {
        self.message = Some(kind);
        self
    }

    /// Only react to messages whose address is of this variant.
    #[must_use]
    pub fn matching_address(mut self, kind: AddressKind) -> Self {
        self.address = Some(kind);
        self
    }

    fn accepts(&self, address: &Address, msg: &Message) -> bool {
        self.message.is_none_or(|kind| kind == msg.kind())
            && self.address.is_none_or(|kind| kind == address.kind())
    }
}

impl Handler for SimpleHandler {
    fn mask(&self) -> HandlerMask {
        let mut mask = HandlerMask::NONE;
        if self.inbound.is_some() {
            mask = mask | HandlerMask::READ;
        }
        if self.outbound.is_some() {
            mask = mask | HandlerMask::WRITE;
        }
        mask
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match &self.inbound {
            Some(f) if self.accepts(&sender, &msg) => f(ctx, sender, msg, done),
            _ => {
                ctx.pass_inbound(sender, msg, done);
                Ok(())
            }
        }
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match &self.outbound {
            Some(f) if self.accepts(&recipient, &msg) => f(ctx, recipient, msg, done),
            _ => {
                ctx.pass_outbound(recipient, msg, done);
                Ok(())
            }
        }
    }
}
