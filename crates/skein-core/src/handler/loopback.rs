//! Loopback of messages addressed to the local node.

use crate::message::{Address, AddressKind, Message, MessageKind};
use crate::pipeline::SimpleHandler;

/// Stage turning outbound application messages for this node into inbound
/// ones, so they never reach the network.
#[must_use]
pub fn loopback() -> SimpleHandler {
    SimpleHandler::outbound(|ctx, recipient, msg, done| {
        match recipient {
            Address::Peer(key) if key == ctx.identity().public_key() => {
                ctx.pass_inbound(recipient, msg, done);
            }
            _ => ctx.pass_outbound(recipient, msg, done),
        }
        Ok(())
    })
    .matching_message(MessageKind::Application)
    .matching_address(AddressKind::Peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::NodeConfig;
    use crate::identity::Identity;
    use crate::message::{AppMessage, Event};
    use crate::testing::{self, Recorder};

    #[tokio::test]
    async fn test_message_to_self_is_delivered() {
        let me = Identity::generate(0);
        let (pipeline, events) = testing::pipeline(NodeConfig::default(), me.clone());
        let network = Recorder::outbound();
        pipeline.add_first("network", network.clone()).unwrap();
        pipeline.add_last("loopback", Arc::new(loopback())).unwrap();

        let message = AppMessage::new("string", &b"hi me"[..]);
        pipeline
            .process_outbound(
                Address::Peer(me.public_key()),
                Message::Application(message.clone()),
            )
            .await
            .unwrap();

        assert!(network.take().is_empty());
        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::MessageReceived {
                sender: Address::Peer(me.public_key()),
                message,
            }]
        );
    }

    #[tokio::test]
    async fn test_message_to_others_passes() {
        let me = Identity::generate(0);
        let (pipeline, _) = testing::pipeline(NodeConfig::default(), me);
        let network = Recorder::outbound();
        pipeline.add_first("network", network.clone()).unwrap();
        pipeline.add_last("loopback", Arc::new(loopback())).unwrap();

        let other = Address::Peer(Identity::generate(0).public_key());
        pipeline
            .process_outbound(other, Message::Application(AppMessage::new("string", &b"x"[..])))
            .await
            .unwrap();
        assert_eq!(network.take().len(), 1);
    }
}
