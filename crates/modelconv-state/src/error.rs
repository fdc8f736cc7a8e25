//! Error types for modelconv-state

use thiserror::Error;

/// Errors that can occur while persisting or loading a results ledger
#[derive(Error, Debug)]
pub enum StateError {
    /// Operation name cannot be used as a ledger file name
    #[error("Invalid operation name: {0:?}")]
    InvalidName(String),

    /// Serialization error
    #[error("Serialization failed for ledger {name}: {reason}")]
    Serialization { name: String, reason: String },

    /// Deserialization error
    #[error("Deserialization failed for ledger {name}: {reason}")]
    Deserialization { name: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for ledger operations
pub type StateResult<T> = std::result::Result<T, StateError>;
