//! # skein Core
//!
//! Core of the skein overlay node.
//!
//! This crate provides:
//! - The wire envelope with partial (public header only) decoding
//! - The handler pipeline with completion tokens and outbound backpressure
//! - Chunking of oversized envelopes and bounded reassembly
//! - Admission, arming and routing stages
//! - The routing registry shared by discovery stages
//! - Node configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Application                               │
//! │   (AppMessage in, Event::MessageReceived out)                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Pipeline                                 │
//! │   (serializer, routing, discovery, guards, arm, chunking)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Envelopes                                │
//! │   (magic, public header, private header and body)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod identity;
pub mod message;
pub mod peers;
pub mod pipeline;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{ExpiringMap, RemovalCause};
pub use config::{ConfigError, NodeConfig};
pub use error::{ChunkError, HandlerError, HandlerResult, PipelineError, PolicyViolation, ProtocolError};
pub use identity::Identity;
pub use message::{Address, AddressKind, AppMessage, Event, Message, MessageKind};
pub use peers::{PathId, PeersManager};
pub use pipeline::{
    Completer, CompletionHandle, EventSink, Executors, Handler, HandlerContext, HandlerMask,
    Outcome, Pipeline, Services, SimpleHandler, WeakHandlerContext,
};
pub use protocol::{Body, MessageType, Nonce, RemoteEnvelope};

/// Default UDP port of a node
pub const DEFAULT_PORT: u16 = 22527;
