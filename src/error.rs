//! Error types for the blendtrain supervisor

use thiserror::Error;

/// Main error type for supervisor operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, fatal before the training loop starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// A checkpoint slot that has never been written. Expected on the
    /// first run; the driver treats it as "start fresh".
    #[error("Checkpoint slot '{slot}' not found")]
    CheckpointNotFound { slot: String },

    /// Checkpoint store error other than a missing slot
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary (de)serialization error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether this error is a missing checkpoint slot
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CheckpointNotFound { .. })
    }
}
