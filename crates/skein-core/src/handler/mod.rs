//! Pipeline stages shipped with the core.
//!
//! In canonical order from the network side, with the discovery stages
//! of `skein-discovery` shown where the node places them:
//!
//! | Stage | Inbound | Outbound |
//! |-------|---------|----------|
//! | [`EnvelopeCodec`] | datagram to envelope | envelope to datagram |
//! | [`ChunkingHandler`] | reassembles chunks for this node | splits oversized envelopes |
//! | [`OtherNetworkFilter`] | drops foreign network ids | |
//! | [`InvalidProofOfWorkFilter`] | drops weak identities | |
//! | [`ArmHandler`] | disarms envelopes for this node | arms envelopes from this node |
//! | [`RateLimiter`] | bounds control messages per sender | |
//! | [`HopCountGuard`] | | enforces the hop limit |
//! | internet discovery | pings, pongs, unites, relaying | routes known and super peers |
//! | local network discovery | multicast announcements | routes peers seen on the segment |
//! | local host discovery | | routes peers announced on this host |
//! | [`StaticRoutes`] | | routes configured keys |
//! | [`MessageSerializer`] | envelope to application message | application message to envelope |
//! | [`loopback`] | | turns messages for this node around |

mod arm;
mod chunking;
mod codec;
mod collector;
mod filters;
mod hop_count;
mod loopback;
mod rate_limiter;
pub mod serializer;
mod static_routes;

pub use arm::ArmHandler;
pub use chunking::{ChunkingHandler, split};
pub use codec::EnvelopeCodec;
pub use collector::ChunksCollector;
pub use filters::{InvalidProofOfWorkFilter, OtherNetworkFilter};
pub use hop_count::HopCountGuard;
pub use loopback::loopback;
pub use rate_limiter::RateLimiter;
pub use serializer::{MessageSerializer, Serialization};
pub use static_routes::{STATIC_ROUTES_PATH, StaticRoutes};

use tracing::debug;

use crate::error::HandlerError;
use crate::message::Address;
use crate::pipeline::{Completer, HandlerContext};

/// Drop a message: log it and fail its operation.
pub fn drop_message(
    ctx: &HandlerContext,
    address: &Address,
    reason: impl Into<HandlerError>,
    done: Completer,
) {
    let reason = reason.into();
    debug!(handler = ctx.name(), %address, "message dropped: {reason}");
    done.fail(reason);
}
