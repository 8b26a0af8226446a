//! Chunking of oversized envelopes.
//!
//! Outbound envelopes whose encoding exceeds the MTU are cut into chunk
//! envelopes. Every chunk repeats the routing fields of the original so
//! relays can forward it without reassembly. The head chunk (number 0)
//! announces the total, body chunks carry their number.
//!
//! Inbound chunks addressed to this node are collected per message id.
//! Collectors that never complete expire a fixed time after creation.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

use super::collector::ChunksCollector;
use super::drop_message;
use crate::cache::{ExpiringMap, RemovalCause};
use crate::config::MessageConfig;
use crate::error::{ChunkError, HandlerResult, PolicyViolation};
use crate::message::{Address, Event, Message};
use crate::pipeline::{Completer, Handler, HandlerContext, HandlerMask};
use crate::protocol::{ChunkPosition, MAGIC, Nonce, RemoteEnvelope};

/// Collectors kept at most; the oldest is evicted beyond that.
const COLLECTOR_CAPACITY: usize = 1_000;

/// Cut `envelope` into chunks whose encoding fits `mtu`.
///
/// Returns the envelope itself if it already fits.
///
/// # Errors
///
/// Returns [`PolicyViolation::MessageTooLarge`] if the MTU leaves no room
/// for payload or the message needs more chunks than the wire can number.
pub fn split(envelope: RemoteEnvelope, mtu: usize) -> Result<Vec<RemoteEnvelope>, PolicyViolation> {
    let size = envelope.encoded_len();
    if size <= mtu {
        return Ok(vec![envelope]);
    }

    let header = envelope.header().clone().with_agreement_id(None);
    let chunk_header_len = header
        .clone()
        .with_chunk(ChunkPosition::Head { total: 1 })
        .encoded_len();
    let overhead = MAGIC.len() + 2 + chunk_header_len;
    let chunk_size = mtu.saturating_sub(overhead);
    if chunk_size == 0 {
        return Err(PolicyViolation::MessageTooLarge { size, max: mtu });
    }
    let total = u16::try_from(size.div_ceil(chunk_size)).map_err(|_| {
        PolicyViolation::MessageTooLarge {
            size,
            max: chunk_size * usize::from(u16::MAX),
        }
    })?;

    let encoded = envelope.encode();
    let chunks = (0..total)
        .map(|number| {
            let start = usize::from(number) * chunk_size;
            let end = (start + chunk_size).min(size);
            let position = if number == 0 {
                ChunkPosition::Head { total }
            } else {
                ChunkPosition::Body { number }
            };
            RemoteEnvelope::from_parts(
                header.clone().with_chunk(position),
                encoded.slice(start..end),
            )
        })
        .collect();
    Ok(chunks)
}

/// Splits outbound envelopes and reassembles inbound chunks.
pub struct ChunkingHandler {
    mtu: usize,
    max_content_length: usize,
    collectors: Arc<ExpiringMap<Nonce, ChunksCollector>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkingHandler {
    /// Create the stage from the message limits.
    #[must_use]
    pub fn new(config: &MessageConfig) -> Self {
        let collectors = ExpiringMap::new(
            COLLECTOR_CAPACITY,
            config.composed_message_transfer_timeout(),
        )
        .with_removal_listener(|nonce: Nonce, collector: ChunksCollector, cause: RemovalCause| {
            let total = collector
                .total()
                .map_or_else(|| "?".to_string(), |total| total.to_string());
            debug!(
                %nonce,
                ?cause,
                "dropped incomplete chunked message: {} of {} chunks present",
                collector.present(),
                total
            );
        });
        Self {
            mtu: config.mtu,
            max_content_length: config.max_content_length,
            collectors: Arc::new(collectors),
            sweeper: Mutex::new(None),
        }
    }

    /// Messages currently being reassembled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.collectors.len()
    }

    fn start_sweeper(&self, ctx: &HandlerContext) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let collectors = self.collectors.clone();
        let period = collectors.ttl();
        *sweeper = Some(ctx.executors().spawn_independent(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                collectors.purge_expired();
            }
        }));
    }

    fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.collectors.clear();
    }
}

impl Drop for ChunkingHandler {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl Handler for ChunkingHandler {
    fn mask(&self) -> HandlerMask {
        HandlerMask::READ | HandlerMask::WRITE | HandlerMask::EVENT
    }

    fn on_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        self.stop_sweeper();
        Ok(())
    }

    fn on_event(&self, ctx: &HandlerContext, event: Event, done: Completer) -> HandlerResult {
        match &event {
            Event::NodeUp { .. } => self.start_sweeper(ctx),
            Event::NodeDown | Event::NodeUnrecoverableError { .. } => self.stop_sweeper(),
            _ => {}
        }
        ctx.pass_event(event, done);
        Ok(())
    }

    fn on_inbound(
        &self,
        ctx: &HandlerContext,
        sender: Address,
        msg: Message,
        done: Completer,
    ) -> HandlerResult {
        let envelope = match msg {
            Message::Envelope(envelope)
                if envelope.is_chunk()
                    && envelope.recipient() == Some(ctx.identity().public_key()) =>
            {
                envelope
            }
            msg => {
                ctx.pass_inbound(sender, msg, done);
                return Ok(());
            }
        };

        let nonce = envelope.nonce();
        let max = self.max_content_length;
        let added = self.collectors.with_or_insert(
            nonce,
            || ChunksCollector::new(nonce, max),
            |collector| collector.add_chunk(&envelope),
        );
        match added {
            Ok(None) => done.complete(),
            Ok(Some(composed)) => {
                self.collectors.remove(&nonce);
                match RemoteEnvelope::decode(composed) {
                    Ok(message) => ctx.pass_inbound(sender, Message::Envelope(message), done),
                    Err(err) => drop_message(ctx, &sender, err, done),
                }
            }
            Err(err) => {
                if matches!(err, ChunkError::TooLarge { .. } | ChunkError::OutOfRange { .. }) {
                    self.collectors.remove(&nonce);
                }
                drop_message(ctx, &sender, err, done);
            }
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
        let Message::Envelope(envelope) = msg else {
            ctx.pass_outbound(recipient, msg, done);
            return Ok(());
        };
        let size = envelope.encoded_len();
        if size > self.max_content_length {
            let violation = PolicyViolation::MessageTooLarge {
                size,
                max: self.max_content_length,
            };
            drop_message(ctx, &recipient, violation, done);
            return Ok(());
        }

        if size <= self.mtu {
            ctx.pass_outbound(recipient, Message::Envelope(envelope), done);
            return Ok(());
        }
        let chunks = match split(envelope, self.mtu) {
            Ok(chunks) => chunks,
            Err(violation) => {
                drop_message(ctx, &recipient, violation, done);
                return Ok(());
            }
        };

        debug!(%recipient, chunks = chunks.len(), size, "sending chunked message");
        let completers = done.fan_out(chunks.len());
        for (chunk, done) in chunks.into_iter().zip(completers) {
            ctx.pass_outbound(recipient, Message::Envelope(chunk), done);
        }
        Ok(())
    }
}
