//! Arming and disarming of envelopes.
//!
//! Envelopes originating here are armed for their recipient; envelopes for
//! this node are disarmed. Relayed envelopes are left alone. The associated
//! data is the public header with the agreement id set and the hop count
//! zeroed, so relays can still count hops.

use std::sync::Arc;

use bytes::Bytes;
use skein_crypto::Armor;

use super::drop_message;
use crate::error::{HandlerError, HandlerResult, PolicyViolation};
use crate::message::{Address, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};
use crate::protocol::RemoteEnvelope;

/// Arms outbound and disarms inbound envelopes.
///
/// Unarmed envelopes addressed to this node are dropped.
pub struct ArmHandler {
    armor: Arc<dyn Armor>,
}

impl ArmHandler {
    /// Create the stage around an armor.
    #[must_use]
    pub fn new(armor: Arc<dyn Armor>) -> Self {
        Self { armor }
    }

    fn arm(&self, envelope: RemoteEnvelope) -> Result<RemoteEnvelope, HandlerError> {
        let Some(recipient) = envelope.recipient() else {
            return Ok(envelope);
        };
        let agreement = self.armor.agreement_id(&recipient)?;
        let aad = envelope
            .header()
            .clone()
            .with_agreement_id(Some(agreement))
            .associated_data();
        let ciphertext = self.armor.arm(
            &recipient,
            envelope.nonce().as_bytes(),
            &aad,
            envelope.remainder(),
        )?;
        Ok(envelope.armed(agreement, Bytes::from(ciphertext)))
    }
}

impl Handler for ArmHandler {
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
        let me = ctx.identity().public_key();
        let envelope = match msg {
            Message::Envelope(envelope)
                if !envelope.is_chunk()
                    && envelope.recipient() == Some(me)
                    && envelope.sender() != me =>
            {
                envelope
            }
            msg => {
                ctx.pass_inbound(sender, msg, done);
                return Ok(());
            }
        };
        let Some(agreement) = envelope.header().agreement_id() else {
            drop_message(ctx, &sender, PolicyViolation::Unarmed, done);
            return Ok(());
        };

        let aad = envelope.header().associated_data();
        let disarmed = self.armor.disarm(
            &envelope.sender(),
            &agreement,
            envelope.nonce().as_bytes(),
            &aad,
            envelope.remainder(),
        );
        match disarmed {
            Ok(cleartext) => {
                let envelope = envelope.disarmed(Bytes::from(cleartext));
                ctx.pass_inbound(sender, Message::Envelope(envelope), done);
            }
            Err(err) => drop_message(ctx, &sender, err, done),
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
        let me = ctx.identity().public_key();
        match msg {
            Message::Envelope(envelope)
                if envelope.sender() == me
                    && envelope.recipient().is_some_and(|to| to != me)
                    && !envelope.is_armed()
                    && !envelope.is_chunk() =>
            {
                let armed = self.arm(envelope)?;
                ctx.pass_outbound(recipient, Message::Envelope(armed), done);
            }
            msg => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    }
}
