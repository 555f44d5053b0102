//! Error types for the node facade.

use peerbase_core::SchemaError;
use peerbase_store::StoreError;
use peerbase_sync::SyncError;
use thiserror::Error;

/// Errors reading or interpreting a node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML or does not match the expected shape.
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A table definition is invalid.
    #[error("invalid table definition: {0}")]
    Schema(#[from] SchemaError),

    /// A value is out of range or inconsistent with another.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The logging subscriber could not be installed.
    #[error("cannot initialise logging: {0}")]
    Logging(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
