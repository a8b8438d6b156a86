//! Error types for taxa.

use thiserror::Error;

/// Result type alias using taxa's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for taxa operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Taxon not found
    #[error("Taxon not found: {0}")]
    TaxonNotFound(i64),

    /// Registry responded with an error or an undecodable payload
    #[error("Registry error: {0}")]
    Registry(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
