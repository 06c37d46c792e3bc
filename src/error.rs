use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelocateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into RelocateError automatically

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Statement failed: {message} (statement: {statement})")]
    StatementFailed { statement: String, message: String },

    #[error("Database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Copy from {source_root} to {destination_root} failed with exit code {exit_code}")]
    CopyFailed {
        source_root: String,
        destination_root: String,
        exit_code: i32,
    },

    #[error("Volume {0} not found")]
    VolumeNotFound(String),

    #[error("Relabel of {from} to {to} failed: {message}")]
    RelabelFailed {
        from: String,
        to: String,
        message: String,
    },

    #[error("Insufficient space on {volume}: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        volume: String,
        required: u64,
        available: u64,
    },

    #[error("Invalid job description: {0}")]
    PartitionMissingOrConfigInvalid(String),

    #[error("Phase failed: {0}")]
    PhaseFailed(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl RelocateError {
    /// Shorthand for a rejected statement
    pub fn statement_failed(statement: &str, message: impl Into<String>) -> Self {
        RelocateError::StatementFailed {
            statement: statement.to_owned(),
            message: message.into(),
        }
    }
}
