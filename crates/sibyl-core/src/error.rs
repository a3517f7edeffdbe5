use thiserror::Error;

/// Top-level error type for the Sibyl system.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for SibylError` so that the `?` operator works
/// seamlessly across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SibylError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The referenced chat or user does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An identifier that must be fresh already exists. The caller retries
    /// with a new identifier; the repository never retries internally.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A request was rejected before any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for SibylError {
    fn from(err: toml::de::Error) -> Self {
        SibylError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SibylError {
    fn from(err: toml::ser::Error) -> Self {
        SibylError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SibylError {
    fn from(err: serde_json::Error) -> Self {
        SibylError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Sibyl operations.
pub type Result<T> = std::result::Result<T, SibylError>;
