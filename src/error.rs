//! Error types for the dispatch engine.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Item error: {0}")]
    Item(#[from] ItemError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Capability/parameter canonicalization errors.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("Invalid configuration field {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Unknown worker {id}")]
    Unknown { id: String },

    #[error("Credential rejected for worker {id}")]
    Unauthorized { id: String },
}

/// Work item errors.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("Item {id} not found")]
    NotFound { id: Uuid },

    #[error("Item {id} in state {state} cannot accept {signal}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        signal: String,
    },

    #[error("Parent {parent_id} does not belong to conversation {conversation_id}")]
    ParentMismatch {
        parent_id: Uuid,
        conversation_id: Uuid,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
