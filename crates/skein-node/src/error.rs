//! Error types of the node API
//!
//! Errors are categorized to support retry logic:
//!
//! - **Transient**: may succeed on retry (transport hiccups, full outbound buffer)
//! - **Permanent**: will not succeed without intervention (invalid config, bad state)
//!
//! # Example
//!
//! ```no_run
//! use skein_node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {err}");
//!     } else {
//!         println!("Permanent error: {err}");
//!     }
//! }
//! ```

use std::borrow::Cow;

use skein_core::{ConfigError, PipelineError};
use skein_transport::TransportError;
use thiserror::Error;

/// Errors of node setup and lifecycle
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Executor setup failed
    #[error("Runtime error: {0}")]
    Runtime(Cow<'static, str>),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// A pipeline operation failed
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Transport(_) | NodeError::Pipeline(PipelineError::CapacityExceeded { .. })
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_) | NodeError::ConfigParse(_) | NodeError::InvalidState(_)
        )
    }

    /// Invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        NodeError::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::ConfigParse(err.to_string())
    }
}

impl From<toml::ser::Error> for NodeError {
    fn from(err: toml::ser::Error) -> Self {
        NodeError::ConfigParse(err.to_string())
    }
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
