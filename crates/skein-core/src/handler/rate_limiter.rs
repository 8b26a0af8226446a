//! Per-sender rate limit on control messages.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use skein_crypto::IdentityPublicKey;
use tokio::time::Instant;

use super::drop_message;
use crate::config::RateLimitConfig;
use crate::error::{HandlerResult, PolicyViolation};
use crate::message::{Address, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};
use crate::protocol::MessageType;

struct Window {
    counts: HashMap<IdentityPublicKey, (Instant, usize)>,
    last_cleanup: Instant,
}

/// Bounds discovery, acknowledgement and unite messages addressed to this
/// node per sender and window. Excess messages are dropped.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    /// Create a limiter from its configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.max_control_messages,
            window: config.window(),
            state: Mutex::new(Window {
                counts: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Count one message from `sender`; `false` once the limit is reached.
    pub fn check(&self, sender: IdentityPublicKey) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now.duration_since(state.last_cleanup) >= self.window * 2 {
            let window = self.window;
            state
                .counts
                .retain(|_, (start, _)| now.duration_since(*start) < window * 2);
            state.last_cleanup = now;
        }

        let entry = state.counts.entry(sender).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Senders currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .len()
    }
}

impl Handler for RateLimiter {
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
            let control = matches!(
                envelope.message_type(),
                Ok(MessageType::Discovery | MessageType::Acknowledgement | MessageType::Unite)
            );
            if control
                && envelope.recipient() == Some(ctx.identity().public_key())
                && !self.check(envelope.sender())
            {
                drop_message(ctx, &sender, PolicyViolation::RateLimited, done);
                return Ok(());
            }
        }
        ctx.pass_inbound(sender, msg, done);
        Ok(())
    }
}
