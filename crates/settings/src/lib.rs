//! Discovery P2P Settings
//!
//! Node configuration file management.
//!
//! ## Features
//!
//! - Local interface settings (name, identity, listen port)
//! - Static peer list and optional bootstrap addresses
//! - libp2p identity encoding (base64 protobuf)
//! - JSON serialization
//!
//! ## Usage
//!
//! ```no_run
//! use discovery_settings::Config;
//!
//! // Generate a fresh identity and write it out
//! let config = Config::generate("hs0")?;
//! config.write("./hs0.json")?;
//!
//! // Read it back and decode the keypair
//! let config = Config::read("./hs0.json")?;
//! let keypair = config.keypair()?;
//! # Ok::<(), discovery_settings::SettingsError>(())
//! ```

mod config;

pub use config::{
    Config, Interface,
    DEFAULT_INTERFACE_NAME, DEFAULT_PORT, DEFAULT_TOPIC,
};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read config: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write config: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Config path used when none is given: `./<interface-name>.json`
pub fn default_config_path(interface_name: &str) -> PathBuf {
    PathBuf::from(".").join(format!("{}.json", interface_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        assert_eq!(default_config_path("hs0"), PathBuf::from("./hs0.json"));
    }

    #[test]
    fn test_error_display_invalid_key() {
        let err = SettingsError::InvalidKey("bad base64".to_string());
        assert_eq!(err.to_string(), "Invalid private key: bad base64");
    }
}
