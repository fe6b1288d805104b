//! Error types for equation discovery training

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Non-finite loss at iteration {iteration}, batch {batch}")]
    NonFinite { iteration: usize, batch: usize },

    #[error("Collaborator contract violation: {0}")]
    Contract(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
