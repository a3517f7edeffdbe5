//! Transport seam between the session and the answer producer.
//!
//! The producer is an opaque upstream service: the session POSTs a query
//! payload and reads back a chunked byte stream. Tests substitute an
//! in-process transport behind the same trait.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sibyl_core::types::Turn;

use crate::error::StreamError;

/// Ordered chunk stream from the producer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Request body for the producer's streaming query endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: u32,
    pub model: String,
    pub user_id: String,
    /// Prior turns up to and including the just-added user turn.
    pub previous_messages: Vec<Turn>,
}

/// Opens one chunked response stream per query.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &QueryRequest) -> Result<ByteStream, StreamError>;
}

/// HTTP transport: POST the payload, stream the response body.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, request: &QueryRequest) -> Result<ByteStream, StreamError> {
        debug!(endpoint = %self.endpoint, query = %request.query, "Opening query stream");

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Transport(format!(
                "producer returned {}",
                status
            )));
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| StreamError::Transport(e.to_string())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_core::types::{Message, Role};

    #[test]
    fn test_query_request_wire_shape() {
        let request = QueryRequest {
            query: "what changed?".to_string(),
            top_k: 5,
            model: "gemini".to_string(),
            user_id: "a@b.c".to_string(),
            previous_messages: vec![Turn::from(&Message::user("what changed?"))],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["query"], "what changed?");
        assert_eq!(json["top_k"], 5);
        assert_eq!(json["user_id"], "a@b.c");
        assert_eq!(json["previous_messages"][0]["role"], "user");
        assert_eq!(json["previous_messages"][0]["content"], "what changed?");
    }

    #[test]
    fn test_turn_role_serializes_lowercase() {
        let turn = Turn {
            role: Role::Assistant,
            content: "answer".to_string(),
        };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
