//! Partitioned backend: chats and messages in separate keyspaces.
//!
//! Messages are keyed `(chat_id, message_id)` with
//! `message_id = <millisecond timestamp>#<random suffix>`, so a plain
//! ascending key-range scan yields chronological order with no secondary
//! sort column, and the suffix keeps same-millisecond appends from
//! colliding. The only two invariants that need coordination are enforced
//! by conditional writes: no duplicate chat identifiers on create, no
//! append to a nonexistent chat.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use sibyl_core::error::{Result, SibylError};
use sibyl_core::types::{Chat, Message, User};

use crate::db::Database;
use crate::embedded::OptionalExt;
use crate::migrations;
use crate::repository::{
    from_millis, role_from_str, source_docs_from_json, source_docs_to_json, to_millis,
    user_role_from_str, user_role_to_str, ChatRepository, UserRepository,
};

const SORT_KEY_SUFFIX_LEN: usize = 6;

/// Chat store over the partition/sort-key schema.
pub struct PartitionedChatRepository {
    db: Arc<Database>,
    /// Strictly increasing millisecond clock for sort-key prefixes, so that
    /// appends landing in the same wall-clock millisecond still read back
    /// in append order.
    key_clock: AtomicI64,
}

impl PartitionedChatRepository {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(migrations::run_partitioned_migrations)?;
        Ok(Self {
            db,
            key_clock: AtomicI64::new(0),
        })
    }

    /// Allocate the next sort key: `<millis>#<random suffix>`.
    fn next_message_id(&self, now_millis: i64) -> String {
        let millis = self
            .key_clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.max(now_millis - 1) + 1)
            })
            .map(|prev| prev.max(now_millis - 1) + 1)
            .unwrap_or(now_millis);

        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(SORT_KEY_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("{}#{}", millis, suffix)
    }

    fn insert_message(
        &self,
        conn: &rusqlite::Connection,
        chat_id: &str,
        message_id: &str,
        message: &Message,
    ) -> Result<()> {
        let timestamp = message
            .timestamp
            .ok_or_else(|| SibylError::Storage("message timestamp unset".to_string()))?;
        conn.execute(
            "INSERT INTO messages (chat_id, message_id, role, content, timestamp, source_docs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                chat_id,
                message_id,
                message.role.as_str(),
                message.content,
                to_millis(timestamp),
                source_docs_to_json(&message.source_docs)?,
            ],
        )
        .map_err(|e| SibylError::Storage(format!("Failed to store message: {}", e)))?;
        Ok(())
    }

    fn scan_messages(&self, conn: &rusqlite::Connection, chat_id: &str) -> Result<Vec<Message>> {
        let mut stmt = conn
            .prepare(
                "SELECT role, content, timestamp, source_docs
                 FROM messages WHERE chat_id = ?1
                 ORDER BY message_id ASC",
            )
            .map_err(|e| SibylError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![chat_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(|e| SibylError::Storage(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, timestamp, source_docs) =
                row.map_err(|e| SibylError::Storage(e.to_string()))?;
            messages.push(Message {
                role: role_from_str(&role)?,
                content,
                timestamp: Some(from_millis(timestamp)),
                source_docs: source_docs_from_json(source_docs)?,
            });
        }
        Ok(messages)
    }
}

impl ChatRepository for PartitionedChatRepository {
    fn create_chat(&self, title: &str, first_message: &Message) -> Result<Chat> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let mut seed = first_message.clone();
        if seed.timestamp.is_none() {
            seed.timestamp = Some(now);
        }
        let message_id = self.next_message_id(to_millis(now));

        self.db.with_conn(|conn| {
            // Conditional write: a duplicate identifier fails Conflict and
            // the caller retries with a new id.
            conn.execute(
                "INSERT INTO chats (id, title, created_at, last_updated)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, title, to_millis(now), to_millis(now)],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    SibylError::Conflict(format!("chat {} already exists", id))
                }
                other => SibylError::Storage(format!("Failed to create chat: {}", other)),
            })?;

            self.insert_message(conn, &id, &message_id, &seed)
        })?;

        Ok(Chat {
            id,
            title: title.to_string(),
            messages: vec![seed],
            created_at: now,
            last_updated: now,
        })
    }

    fn append_message(&self, chat_id: &str, message: &Message) -> Result<Message> {
        let now = Utc::now();

        let mut stored = message.clone();
        if stored.timestamp.is_none() {
            stored.timestamp = Some(now);
        }
        let message_id = self.next_message_id(to_millis(now));

        self.db.with_conn(|conn| {
            // Two writes, one transaction: the conditional touch of
            // last_updated runs first so an append to a missing chat fails
            // NotFound without leaving an orphaned message row.
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            let touched = tx
                .execute(
                    "UPDATE chats SET last_updated = ?1 WHERE id = ?2",
                    rusqlite::params![to_millis(now), chat_id],
                )
                .map_err(|e| SibylError::Storage(e.to_string()))?;
            if touched == 0 {
                return Err(SibylError::NotFound(format!("chat {}", chat_id)));
            }

            self.insert_message(&tx, chat_id, &message_id, &stored)?;

            tx.commit().map_err(|e| SibylError::Storage(e.to_string()))?;
            Ok(())
        })?;

        Ok(stored)
    }

    fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.db.with_conn(|conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM chats WHERE id = ?1",
                    rusqlite::params![chat_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;
            if exists.is_none() {
                return Err(SibylError::NotFound(format!("chat {}", chat_id)));
            }

            self.scan_messages(conn, chat_id)
        })
    }

    fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>> {
        self.db.with_conn(|conn| {
            let row: Option<(String, String, i64, i64)> = conn
                .query_row(
                    "SELECT id, title, created_at, last_updated FROM chats WHERE id = ?1",
                    rusqlite::params![chat_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            let Some((id, title, created_at, last_updated)) = row else {
                return Ok(None);
            };

            let messages = self.scan_messages(conn, &id)?;
            Ok(Some(Chat {
                id,
                title,
                messages,
                created_at: from_millis(created_at),
                last_updated: from_millis(last_updated),
            }))
        })
    }
}

/// User store over the partitioned schema.
///
/// `create_user` is a conditional put guarded by key absence; the conflict
/// on a repeat call is absorbed and treated as success.
pub struct PartitionedUserRepository {
    db: Arc<Database>,
}

impl PartitionedUserRepository {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(migrations::run_partitioned_migrations)?;
        Ok(Self { db })
    }
}

impl UserRepository for PartitionedUserRepository {
    fn create_user(&self, user: &User) -> Result<User> {
        let chats_json = serde_json::to_string(&user.chats)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (email, name, role, chats) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (email) DO NOTHING",
                rusqlite::params![user.email, user.name, user_role_to_str(user.role), chats_json],
            )
            .map_err(|e| SibylError::Storage(format!("Failed to create user: {}", e)))?;
            Ok(())
        })?;

        // Return the stored record, which on a repeat call is the original.
        self.get_user_by_email(&user.email)?
            .ok_or_else(|| SibylError::Storage("user vanished after conditional put".to_string()))
    }

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.db.with_conn(|conn| {
            let row: Option<(String, String, String, String)> = conn
                .query_row(
                    "SELECT email, name, role, chats FROM users WHERE email = ?1",
                    rusqlite::params![email],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            match row {
                Some((email, name, role, chats_json)) => Ok(Some(User {
                    email,
                    name,
                    role: user_role_from_str(&role)?,
                    chats: serde_json::from_str(&chats_json)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn add_chat_to_user(&self, email: &str, chat_id: &str) -> Result<()> {
        let Some(mut user) = self.get_user_by_email(email)? else {
            return Ok(());
        };
        if user.chats.iter().any(|c| c == chat_id) {
            return Ok(());
        }
        user.chats.push(chat_id.to_string());

        let chats_json = serde_json::to_string(&user.chats)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET chats = ?1 WHERE email = ?2",
                rusqlite::params![chats_json, email],
            )
            .map_err(|e| SibylError::Storage(e.to_string()))?;
            Ok(())
        })
    }
}
