//! Datagram to envelope codec.

use super::drop_message;
use crate::error::HandlerResult;
use crate::message::{Address, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};
use crate::protocol::RemoteEnvelope;

/// Decodes datagrams from sockets and encodes envelopes to sockets.
///
/// Only the public header is decoded; the remainder stays a slice of the
/// received datagram.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Handler for EnvelopeCodec {
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
        match (sender, msg) {
            (Address::Socket(_), Message::Datagram(datagram)) => {
                match RemoteEnvelope::decode(datagram) {
                    Ok(envelope) => ctx.pass_inbound(sender, Message::Envelope(envelope), done),
                    Err(err) => drop_message(ctx, &sender, err, done),
                }
            }
            (sender, msg) => ctx.pass_inbound(sender, msg, done),
        }
        Ok(())
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        match (recipient, msg) {
            (Address::Socket(_), Message::Envelope(envelope)) => {
                ctx.pass_outbound(recipient, Message::Datagram(envelope.encode()), done);
            }
            (recipient, msg) => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}
