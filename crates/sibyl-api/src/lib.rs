//! Sibyl API crate - axum HTTP server for the persistence surface.
//!
//! Provides the REST API over the chat and user repositories: chat
//! creation, message append, ordered read-back, idempotent user
//! registration, and health checks.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
