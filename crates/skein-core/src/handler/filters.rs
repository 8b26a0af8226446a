//! Inbound admission filters.

use super::drop_message;
use crate::error::{HandlerResult, PolicyViolation};
use crate::message::{Address, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};

/// Drops envelopes whose network id differs from the local one.
#[derive(Debug, Default)]
pub struct OtherNetworkFilter;

impl Handler for OtherNetworkFilter {
    fn mask(&self) -> HandlerMask {
        HandlerMask::READ
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        if let Message::Envelope(envelope) = &msg {
            let expected = ctx.config().network_id;
            let actual = envelope.header().network_id();
            if actual != expected {
                drop_message(
                    ctx,
                    &sender,
                    PolicyViolation::ForeignNetwork { expected, actual },
                    done,
                );
                return Ok(());
            }
        }
        ctx.pass_inbound(sender, msg, done);
        Ok(())
    }
}

/// Drops envelopes whose sender proof-of-work is below the configured
/// difficulty.
#[derive(Debug, Default)]
pub struct InvalidProofOfWorkFilter;

impl Handler for InvalidProofOfWorkFilter {
    fn mask(&self) -> HandlerMask {
        HandlerMask::READ
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        if let Message::Envelope(envelope) = &msg {
            let header = envelope.header();
            let difficulty = ctx.config().discovery.proof_of_work_difficulty;
            if !header.proof_of_work().is_valid(&header.sender(), difficulty) {
                drop_message(ctx, &sender, PolicyViolation::InvalidProofOfWork, done);
                return Ok(());
            }
        }
        ctx.pass_inbound(sender, msg, done);
        Ok(())
    }
}
