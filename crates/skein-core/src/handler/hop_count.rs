//! Hop limit enforcement.

use super::drop_message;
use crate::error::{HandlerResult, PolicyViolation};
use crate::message::{Address, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};

/// Increments the hop count of every outbound envelope and drops those
/// that already reached the configured limit.
///
/// Both originated and relayed envelopes pass here, so the count equals
/// the number of nodes an envelope left.
#[derive(Debug, Default)]
pub struct HopCountGuard;

impl Handler for HopCountGuard {
    fn mask(&self) -> HandlerMask {
        HandlerMask::WRITE
    }

    fn on_outbound(
        &self,
        ctx: &HandlerContext,
        recipient: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let Message::Envelope(envelope) = msg else {
            ctx.pass_outbound(recipient, msg, done);
            return Ok(());
        };
        let limit = ctx.config().message.hop_limit;
        if envelope.hop_count() >= limit {
            drop_message(ctx, &recipient, PolicyViolation::HopLimitExceeded { limit }, done);
            return Ok(());
        }
        let envelope = envelope.with_incremented_hop_count()?;
        ctx.pass_outbound(recipient, Message::Envelope(envelope), done);
        Ok(())
    }
}
