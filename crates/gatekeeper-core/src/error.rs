//! Error types for the gatekeeper crate

use std::path::PathBuf;

use h323_ras_core::message::CallIdentifier;
use thiserror::Error;

/// Result type for gatekeeper operations
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// Errors raised while configuring or running the gatekeeper.
///
/// Rejections sent to endpoints are protocol replies, not errors.
#[derive(Debug, Error)]
pub enum GatekeeperError {
    /// Transport or transaction engine failure
    #[error("RAS error: {0}")]
    Ras(#[from] h323_ras_core::Error),

    /// Configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`GatekeeperConfig`](crate::GatekeeperConfig)
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// No endpoint registered under this identifier
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// No call with this identifier
    #[error("Call not found: {0}")]
    CallNotFound(CallIdentifier),

    /// Global subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl GatekeeperError {
    pub fn config(message: impl Into<String>) -> Self {
        GatekeeperError::Config(message.into())
    }
}
