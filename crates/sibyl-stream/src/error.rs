//! Error types for the streaming engine.

use sibyl_core::error::SibylError;

/// Errors from the stream transport and session.
///
/// Frame-level decode failures are deliberately absent: a malformed frame
/// is logged and skipped by the decoder and never aborts the stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("query cannot be empty")]
    EmptyQuery,

    /// Connection-level failure, surfaced once; closes the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The producer ended the stream without a terminal event.
    #[error("stream ended before completion")]
    TruncatedStream,

    /// An `error` event from the producer.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A repository write failed; the in-memory conversation is kept.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Session bookkeeping violation (e.g. a missing draft message).
    #[error("session error: {0}")]
    Session(String),
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}

impl From<SibylError> for StreamError {
    fn from(err: SibylError) -> Self {
        StreamError::Persistence(err.to_string())
    }
}
