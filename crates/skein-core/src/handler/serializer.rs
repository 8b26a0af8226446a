//! Application message serialization.
//!
//! Outbound [`AppMessage`]s addressed to a peer become application
//! envelopes; inbound application envelopes addressed to this node become
//! [`AppMessage`]s with the sender's key as address. Type names are checked
//! against the configured allow-lists in both directions.

use std::collections::HashSet;

use super::drop_message;
use crate::error::{HandlerResult, PolicyViolation, ProtocolError};
use crate::message::{Address, AppMessage, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};
use crate::protocol::{Body, MessageType, RemoteEnvelope};

/// Allow-list of application type names. `*` allows every name.
#[derive(Debug, Clone, Default)]
pub struct Serialization {
    any: bool,
    names: HashSet<String>,
}

impl Serialization {
    /// Build an allow-list from configured names.
    #[must_use]
    pub fn new(names: &[String]) -> Self {
        Self {
            any: names.iter().any(|name| name == "*"),
            names: names.iter().filter(|name| *name != "*").cloned().collect(),
        }
    }

    /// Whether `type_name` may be (de)serialized.
    #[must_use]
    pub fn is_allowed(&self, type_name: &str) -> bool {
        self.any || self.names.contains(type_name)
    }
}

/// Converts between application messages and application envelopes.
#[derive(Debug, Default)]
pub struct MessageSerializer;

impl Handler for MessageSerializer {
    fn mask(&self) -> HandlerMask {
        HandlerMask::READ | HandlerMask::WRITE
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let Message::Envelope(envelope) = msg else {
            ctx.pass_inbound(sender, msg, done);
            return Ok(());
        };
        let me = ctx.identity().public_key();
        if envelope.recipient() != Some(me)
            || envelope.message_type().ok() != Some(MessageType::Application)
        {
            ctx.pass_inbound(sender, Message::Envelope(envelope), done);
            return Ok(());
        }

        let (type_name, payload) = match envelope.body() {
            Ok(Body::Application { type_name, payload }) => (type_name, payload),
            Ok(_) => {
                drop_message(ctx, &sender, ProtocolError::InvalidField("application body"), done);
                return Ok(());
            }
            Err(err) => {
                drop_message(ctx, &sender, err, done);
                return Ok(());
            }
        };
        if !ctx.inbound_serialization().is_allowed(&type_name) {
            drop_message(ctx, &sender, PolicyViolation::TypeNotAllowed(type_name), done);
            return Ok(());
        }
        ctx.pass_inbound(
            Address::Peer(envelope.sender()),
            Message::Application(AppMessage { type_name, payload }),
            done,
        );
        Ok(())
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let (Address::Peer(key), Message::Application(message)) = (&recipient, &msg) else {
            ctx.pass_outbound(recipient, msg, done);
            return Ok(());
        };
        if !ctx.outbound_serialization().is_allowed(&message.type_name) {
            let violation = PolicyViolation::TypeNotAllowed(message.type_name.clone());
            drop_message(ctx, &recipient, violation, done);
            return Ok(());
        }
        let envelope = RemoteEnvelope::application(
            ctx.identity(),
            ctx.config().network_id,
            *key,
            message.type_name.clone(),
            message.payload.clone(),
        )?;
        ctx.pass_outbound(recipient, Message::Envelope(envelope), done);
        Ok(())
    }
}
