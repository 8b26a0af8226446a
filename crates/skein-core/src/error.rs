//! Error types for the skein core.
//!
//! Errors follow the drop taxonomy of the node: format errors and security
//! rejections drop a message silently, policy violations drop it with a log
//! entry, capacity errors fail the caller immediately. None of them are
//! fatal to the node.

use std::borrow::Cow;

use skein_crypto::CryptoError;
use thiserror::Error;

/// Wire format errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input does not start with the envelope magic number
    #[error("bad magic number")]
    BadMagic,

    /// Input too short to parse
    #[error("truncated input: expected at least {expected}, got {actual}")]
    Truncated {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Encoded header does not fit its 16-bit length prefix
    #[error("header too large: {0} bytes")]
    HeaderTooLarge(usize),

    /// Unknown private header type byte
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A field carries a value the protocol does not allow
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// Body requested from an envelope that is still armed
    #[error("envelope is armed")]
    Armed,

    /// Body requested from a chunk fragment
    #[error("envelope is a chunk fragment")]
    Fragment,

    /// Hop counter cannot be incremented any further
    #[error("hop count overflow")]
    HopCountOverflow,
}

/// Chunk reassembly errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// All chunks have already been collected
    #[error("all chunks have already been collected")]
    AlreadyComplete,

    /// Envelope carries neither a chunk number nor a chunk total
    #[error("envelope is not a chunk")]
    NotAChunk,

    /// Chunk belongs to another message
    #[error("chunk belongs to another message")]
    IdMismatch,

    /// Chunk number beyond the announced total
    #[error("chunk {number} out of range for {total} chunks")]
    OutOfRange {
        /// Chunk number received
        number: u16,
        /// Announced total
        total: u16,
    },

    /// Reassembled message would exceed the maximum content length
    #[error("chunked message exceeds {max} bytes (would reach {size})")]
    TooLarge {
        /// Configured maximum
        max: usize,
        /// Size the message would have reached
        size: usize,
    },
}

/// Policy violations that drop a message
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Hop limit reached
    #[error("hop limit of {limit} exceeded")]
    HopLimitExceeded {
        /// Configured limit
        limit: u8,
    },

    /// Envelope from another overlay network
    #[error("message from foreign network {actual} (expected {expected})")]
    ForeignNetwork {
        /// Local network id
        expected: i32,
        /// Network id in the envelope
        actual: i32,
    },

    /// Sender proof-of-work below the required difficulty
    #[error("invalid proof of work")]
    InvalidProofOfWork,

    /// Too many control messages from one sender
    #[error("rate limit exceeded")]
    RateLimited,

    /// Outbound message larger than the maximum content length
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Encoded size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Envelope addressed to another node while relaying is disabled
    #[error("relaying disabled on this node")]
    NotARelay,

    /// Inbound envelope for this node without an agreement id
    #[error("unarmed message")]
    Unarmed,

    /// Application type name not on the allow-list
    #[error("type {0} not allowed")]
    TypeNotAllowed(String),
}

/// Error raised or propagated by a pipeline stage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Malformed envelope
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Chunk reassembly failure
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Policy rejection
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// Arming or disarming failed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport write failed
    #[error("transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Anything else a stage fails with
    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl HandlerError {
    /// Build an [`HandlerError::Other`] from any message.
    pub fn other(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Other(message.into())
    }
}

/// Outcome error of a pipeline operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A handler with this name is already registered
    #[error("duplicate handler name: {0}")]
    DuplicateName(String),

    /// No handler with this name is registered
    #[error("no such handler: {0}")]
    NoSuchHandler(String),

    /// Outbound in-flight budget exhausted
    #[error("outbound messages buffer capacity exceeded ({capacity} messages)")]
    CapacityExceeded {
        /// Size of the in-flight budget
        capacity: usize,
    },

    /// Completion token dropped without being resolved
    #[error("completion abandoned")]
    Abandoned,

    /// Outbound message reached the head of the pipeline without being written
    #[error("no stage wrote the outbound message")]
    Unroutable,

    /// A stage failed the operation
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl From<ProtocolError> for PipelineError {
    fn from(err: ProtocolError) -> Self {
        Self::Handler(err.into())
    }
}

impl From<ChunkError> for PipelineError {
    fn from(err: ChunkError) -> Self {
        Self::Handler(err.into())
    }
}

impl From<PolicyViolation> for PipelineError {
    fn from(err: PolicyViolation) -> Self {
        Self::Handler(err.into())
    }
}

impl From<CryptoError> for PipelineError {
    fn from(err: CryptoError) -> Self {
        Self::Handler(err.into())
    }
}

/// Result type of handler callbacks
pub type HandlerResult = Result<(), HandlerError>;
