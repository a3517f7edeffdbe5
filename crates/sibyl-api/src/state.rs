//! Application state shared across all route handlers.
//!
//! AppState holds the configuration and the selected storage backend's
//! repository pair. It is passed to handlers via axum's State extractor.

use std::sync::Arc;

use sibyl_core::config::SibylConfig;
use sibyl_storage::Storage;

/// Shared application state. Cheap to clone across handler tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SibylConfig>,
    pub storage: Storage,
}

impl AppState {
    pub fn new(config: SibylConfig, storage: Storage) -> Self {
        Self {
            config: Arc::new(config),
            storage,
        }
    }
}
