//! Sibyl storage crate - chat and user persistence over SQLite.
//!
//! Provides a WAL-mode SQLite database handle, the repository contracts for
//! chats and users, and two structurally different backend implementations
//! behind those contracts: an embedded-document model (a chat row owns its
//! message list) and a partition/sort-key model (chats and messages in
//! separate keyspaces). Backend selection happens once per process.

pub mod db;
pub mod embedded;
pub mod migrations;
pub mod partitioned;
pub mod provider;
pub mod repository;

pub use db::Database;
pub use embedded::{EmbeddedChatRepository, EmbeddedUserRepository};
pub use partitioned::{PartitionedChatRepository, PartitionedUserRepository};
pub use provider::{global_storage, Storage, StorageBackend};
pub use repository::{ChatRepository, UserRepository};
