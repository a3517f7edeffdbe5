//! Backend selection and the process-wide storage handle.
//!
//! One configuration decision point picks the embedded-document or the
//! partitioned backend; the choice is made once per process and cached.
//! Configuration flows in at construction, never read ad hoc at call sites.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::info;

use sibyl_core::config::StorageConfig;
use sibyl_core::error::{Result, SibylError};

use crate::db::Database;
use crate::embedded::{EmbeddedChatRepository, EmbeddedUserRepository};
use crate::partitioned::{PartitionedChatRepository, PartitionedUserRepository};
use crate::repository::{ChatRepository, UserRepository};

/// Environment override for the configured backend.
pub const BACKEND_ENV_VAR: &str = "SIBYL_STORAGE_BACKEND";

/// The two persistence flavors behind the repository contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// A chat document owns its ordered message list.
    Embedded,
    /// Chats and messages in separate partitions, messages sort-keyed.
    Partitioned,
}

impl StorageBackend {
    /// Parse a backend name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "embedded" => Ok(StorageBackend::Embedded),
            "partitioned" => Ok(StorageBackend::Partitioned),
            other => Err(SibylError::Config(format!(
                "Unknown storage backend: {}",
                other
            ))),
        }
    }

    /// Resolve the backend from config plus an optional environment-style
    /// override (the override wins when set).
    pub fn resolve(configured: &str, env_override: Option<String>) -> Result<Self> {
        match env_override {
            Some(name) if !name.trim().is_empty() => Self::from_name(&name),
            _ => Self::from_name(configured),
        }
    }

    /// Resolve from config and the real process environment.
    pub fn select(config: &StorageConfig) -> Result<Self> {
        Self::resolve(&config.backend, std::env::var(BACKEND_ENV_VAR).ok())
    }
}

/// The repository pair for the selected backend.
#[derive(Clone)]
pub struct Storage {
    pub backend: StorageBackend,
    pub chats: Arc<dyn ChatRepository>,
    pub users: Arc<dyn UserRepository>,
}

impl Storage {
    /// Construct both repositories against one database, applying the
    /// selected backend's schema.
    pub fn open(config: &StorageConfig, data_dir: &Path) -> Result<Self> {
        let backend = StorageBackend::select(config)?;
        let db_path: PathBuf = data_dir.join(&config.db_file);
        let db = Arc::new(Database::open(&db_path)?);
        Self::with_database(backend, db)
    }

    /// Construct over an existing database handle (used by tests and the
    /// in-memory path).
    pub fn with_database(backend: StorageBackend, db: Arc<Database>) -> Result<Self> {
        info!(?backend, "Storage backend selected");
        let storage = match backend {
            StorageBackend::Embedded => Storage {
                backend,
                chats: Arc::new(EmbeddedChatRepository::new(Arc::clone(&db))?),
                users: Arc::new(EmbeddedUserRepository::new(db)?),
            },
            StorageBackend::Partitioned => Storage {
                backend,
                chats: Arc::new(PartitionedChatRepository::new(Arc::clone(&db))?),
                users: Arc::new(PartitionedUserRepository::new(db)?),
            },
        };
        Ok(storage)
    }

    /// In-memory storage for tests.
    pub fn in_memory(backend: StorageBackend) -> Result<Self> {
        Self::with_database(backend, Arc::new(Database::in_memory()?))
    }
}

static GLOBAL: OnceLock<Storage> = OnceLock::new();

/// Process-wide storage handle, constructed on first call and cached for
/// the life of the process. Later calls ignore their arguments.
pub fn global_storage(config: &StorageConfig, data_dir: &Path) -> Result<&'static Storage> {
    if let Some(storage) = GLOBAL.get() {
        return Ok(storage);
    }
    let storage = Storage::open(config, data_dir)?;
    Ok(GLOBAL.get_or_init(|| storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_core::types::Message;

    #[test]
    fn test_backend_from_name() {
        assert_eq!(
            StorageBackend::from_name("embedded").unwrap(),
            StorageBackend::Embedded
        );
        assert_eq!(
            StorageBackend::from_name("Partitioned").unwrap(),
            StorageBackend::Partitioned
        );
        assert!(StorageBackend::from_name("dynamo").is_err());
    }

    #[test]
    fn test_env_override_wins() {
        let backend =
            StorageBackend::resolve("embedded", Some("partitioned".to_string())).unwrap();
        assert_eq!(backend, StorageBackend::Partitioned);
    }

    #[test]
    fn test_blank_override_falls_back_to_config() {
        let backend = StorageBackend::resolve("embedded", Some("  ".to_string())).unwrap();
        assert_eq!(backend, StorageBackend::Embedded);

        let backend = StorageBackend::resolve("partitioned", None).unwrap();
        assert_eq!(backend, StorageBackend::Partitioned);
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let result = StorageBackend::resolve("embedded", Some("mongo".to_string()));
        assert!(matches!(result.unwrap_err(), SibylError::Config(_)));
    }

    #[test]
    fn test_both_backends_satisfy_the_contract() {
        for backend in [StorageBackend::Embedded, StorageBackend::Partitioned] {
            let storage = Storage::in_memory(backend).unwrap();

            let chat = storage
                .chats
                .create_chat("contract", &Message::user("seed"))
                .unwrap();
            storage
                .chats
                .append_message(&chat.id, &Message::user("second"))
                .unwrap();

            let messages = storage.chats.get_messages(&chat.id).unwrap();
            assert_eq!(messages.len(), 2, "backend {:?}", backend);
            assert_eq!(messages[0].content, "seed");
            assert_eq!(messages[1].content, "second");
        }
    }

    #[test]
    fn test_file_backed_storage_opens() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: "embedded".to_string(),
            db_file: "test.db".to_string(),
        };
        let storage = Storage::open(&config, dir.path()).unwrap();
        assert_eq!(storage.backend, StorageBackend::Embedded);
        assert!(dir.path().join("test.db").exists());
    }
}
