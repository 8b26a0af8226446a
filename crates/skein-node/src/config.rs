//! Loading and saving node configuration files.
//!
//! Files are TOML. Every section and field is optional and falls back to its
//! default, so the smallest useful file names only what differs:
//!
//! ```toml
//! network_id = 7
//! listen_addr = "0.0.0.0:22527"
//!
//! [super_peer]
//! enabled = true
//! endpoints = [
//!     { address = "192.0.2.10:22527", public_key = "18cdb2...c1d9" },
//! ]
//! ```

use std::fs;
use std::path::Path;

use skein_core::NodeConfig;
use tracing::debug;

use crate::error::Result;

/// Parse and validate a configuration document.
///
/// # Errors
///
/// Returns [`NodeError::ConfigParse`](crate::NodeError::ConfigParse) for
/// malformed TOML and [`NodeError::InvalidConfig`](crate::NodeError::InvalidConfig)
/// when validation fails.
pub fn parse(contents: &str) -> Result<NodeConfig> {
    let config: NodeConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Read, parse and validate the configuration file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load<P: AsRef<Path>>(path: P) -> Result<NodeConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config = parse(&contents)?;
    debug!(path = %path.display(), network_id = config.network_id, "configuration loaded");
    Ok(config)
}

/// Write `config` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns an error if the configuration cannot be serialized or written.
pub fn save<P: AsRef<Path>>(config: &NodeConfig, path: P) -> Result<()> {
    let contents = toml::to_string_pretty(config)?;
    if let Some(parent) = path.as_ref().parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}
