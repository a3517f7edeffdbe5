//! Embedded-document backend: a chat row physically owns its message list.
//!
//! Mirrors a document database: `append_message` reads the chat document,
//! pushes onto the embedded list, refreshes `last_updated`, and saves the
//! whole document. Array order is insertion order, so chronological
//! read-back needs no sort key.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use sibyl_core::error::{Result, SibylError};
use sibyl_core::types::{Chat, Message, User};

use crate::db::Database;
use crate::migrations;
use crate::repository::{
    from_millis, to_millis, user_role_from_str, user_role_to_str, ChatRepository, UserRepository,
};

/// Chat store over the embedded-document schema.
pub struct EmbeddedChatRepository {
    db: Arc<Database>,
}

impl EmbeddedChatRepository {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(migrations::run_embedded_migrations)?;
        Ok(Self { db })
    }
}

impl ChatRepository for EmbeddedChatRepository {
    fn create_chat(&self, title: &str, first_message: &Message) -> Result<Chat> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let mut seed = first_message.clone();
        if seed.timestamp.is_none() {
            seed.timestamp = Some(now);
        }

        let messages_json = serde_json::to_string(&vec![seed.clone()])?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (id, title, messages, created_at, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, title, messages_json, to_millis(now), to_millis(now)],
            )
            .map_err(|e| SibylError::Storage(format!("Failed to create chat: {}", e)))?;
            Ok(())
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

        // Read-modify-write of the whole document; the single UPDATE keeps
        // each save atomic, but concurrent appends to one chat can race
        // (last writer wins). The stream session is the single writer per
        // chat, which keeps this window out of reach in practice.
        self.db.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT messages FROM chats WHERE id = ?1",
                    rusqlite::params![chat_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            let doc = doc.ok_or_else(|| SibylError::NotFound(format!("chat {}", chat_id)))?;

            let mut messages: Vec<Message> = serde_json::from_str(&doc)?;
            messages.push(stored.clone());
            let updated = serde_json::to_string(&messages)?;

            conn.execute(
                "UPDATE chats SET messages = ?1, last_updated = ?2 WHERE id = ?3",
                rusqlite::params![updated, to_millis(now), chat_id],
            )
            .map_err(|e| SibylError::Storage(format!("Failed to append message: {}", e)))?;
            Ok(())
        })?;

        Ok(stored)
    }

    fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        self.db.with_conn(|conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT messages FROM chats WHERE id = ?1",
                    rusqlite::params![chat_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            let doc = doc.ok_or_else(|| SibylError::NotFound(format!("chat {}", chat_id)))?;
            Ok(serde_json::from_str(&doc)?)
        })
    }

    fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>> {
        self.db.with_conn(|conn| {
            let row: Option<(String, String, String, i64, i64)> = conn
                .query_row(
                    "SELECT id, title, messages, created_at, last_updated
                     FROM chats WHERE id = ?1",
                    rusqlite::params![chat_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| SibylError::Storage(e.to_string()))?;

            match row {
                Some((id, title, messages_json, created_at, last_updated)) => Ok(Some(Chat {
                    id,
                    title,
                    messages: serde_json::from_str(&messages_json)?,
                    created_at: from_millis(created_at),
                    last_updated: from_millis(last_updated),
                })),
                None => Ok(None),
            }
        })
    }
}

/// User store over the embedded-document schema.
///
/// `create_user` is check-then-insert: the window between the existence
/// check and the insert is a known limitation, acceptable because user
/// creation is driven by interactive sign-in.
pub struct EmbeddedUserRepository {
    db: Arc<Database>,
}

impl EmbeddedUserRepository {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(migrations::run_embedded_migrations)?;
        Ok(Self { db })
    }
}

impl UserRepository for EmbeddedUserRepository {
    fn create_user(&self, user: &User) -> Result<User> {
        if let Some(existing) = self.get_user_by_email(&user.email)? {
            return Ok(existing);
        }

        let chats_json = serde_json::to_string(&user.chats)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (email, name, role, chats) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user.email, user.name, user_role_to_str(user.role), chats_json],
            )
            .map_err(|e| SibylError::Storage(format!("Failed to create user: {}", e)))?;
            Ok(())
        })?;

        Ok(user.clone())
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

/// Extension trait for rusqlite to support optional query results.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sibyl_core::types::{Reference, Role};

    fn make_repo() -> EmbeddedChatRepository {
        EmbeddedChatRepository::new(Arc::new(Database::in_memory().unwrap())).unwrap()
    }

    fn make_user_repo() -> EmbeddedUserRepository {
        EmbeddedUserRepository::new(Arc::new(Database::in_memory().unwrap())).unwrap()
    }

    fn sourced_message() -> Message {
        Message {
            role: Role::Assistant,
            content: "answer [1]".to_string(),
            timestamp: None,
            source_docs: Some(vec![Reference {
                title: "Reference [1]".to_string(),
                url: "http://a".to_string(),
                pages: Some("5".to_string()),
            }]),
        }
    }

    #[test]
    fn test_create_chat_returns_seed_message() {
        let repo = make_repo();
        let chat = repo.create_chat("First chat", &Message::user("hello")).unwrap();

        assert_eq!(chat.title, "First chat");
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content, "hello");
        // Server assigned the seed timestamp.
        assert!(chat.messages[0].timestamp.is_some());

        let messages = repo.get_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[test]
    fn test_append_preserves_order() {
        let repo = make_repo();
        let chat = repo.create_chat("", &Message::user("m0")).unwrap();

        for i in 1..=5 {
            repo.append_message(&chat.id, &Message::user(format!("m{}", i)))
                .unwrap();
        }

        let messages = repo.get_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 6);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.content, format!("m{}", i));
        }
    }

    #[test]
    fn test_append_to_missing_chat_is_not_found() {
        let repo = make_repo();
        let result = repo.append_message("no-such-chat", &Message::user("x"));
        assert!(matches!(result.unwrap_err(), SibylError::NotFound(_)));
    }

    #[test]
    fn test_append_updates_last_updated() {
        let repo = make_repo();
        let chat = repo.create_chat("", &Message::user("seed")).unwrap();

        repo.append_message(&chat.id, &Message::user("next")).unwrap();

        let reloaded = repo.get_chat_by_id(&chat.id).unwrap().unwrap();
        assert!(reloaded.last_updated >= chat.last_updated);
        assert_eq!(reloaded.messages.len(), 2);
    }

    #[test]
    fn test_message_round_trip_is_lossless() {
        let repo = make_repo();
        let chat = repo.create_chat("", &Message::user("seed")).unwrap();

        let stored = repo.append_message(&chat.id, &sourced_message()).unwrap();
        let messages = repo.get_messages(&chat.id).unwrap();

        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "answer [1]");
        assert_eq!(messages[1].source_docs, stored.source_docs);
        assert_eq!(messages[1].timestamp, stored.timestamp);
    }

    #[test]
    fn test_caller_timestamp_is_kept() {
        let repo = make_repo();
        let chat = repo.create_chat("", &Message::user("seed")).unwrap();

        let ts = Utc::now() - chrono::Duration::minutes(3);
        let mut msg = Message::user("late insert");
        msg.timestamp = Some(ts);

        let stored = repo.append_message(&chat.id, &msg).unwrap();
        assert_eq!(stored.timestamp.unwrap().timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_get_messages_missing_chat_is_not_found() {
        let repo = make_repo();
        let result = repo.get_messages("nope");
        assert!(matches!(result.unwrap_err(), SibylError::NotFound(_)));
    }

    #[test]
    fn test_get_chat_by_id_missing_is_none() {
        let repo = make_repo();
        assert!(repo.get_chat_by_id("nope").unwrap().is_none());
    }

    #[test]
    fn test_create_user_idempotent() {
        let repo = make_user_repo();
        let user = User::new("a@b.c", "Ada");

        repo.create_user(&user).unwrap();
        repo.create_user(&user).unwrap();

        let stored = repo.get_user_by_email("a@b.c").unwrap().unwrap();
        assert_eq!(stored.name, "Ada");
    }

    #[test]
    fn test_create_user_returns_existing_record() {
        let repo = make_user_repo();
        repo.create_user(&User::new("a@b.c", "Ada")).unwrap();

        // A second create with a different name does not overwrite.
        let second = repo.create_user(&User::new("a@b.c", "Someone Else")).unwrap();
        assert_eq!(second.name, "Ada");
    }

    #[test]
    fn test_add_chat_to_user_skips_duplicates() {
        let repo = make_user_repo();
        repo.create_user(&User::new("a@b.c", "Ada")).unwrap();

        repo.add_chat_to_user("a@b.c", "chat-1").unwrap();
        repo.add_chat_to_user("a@b.c", "chat-1").unwrap();
        repo.add_chat_to_user("a@b.c", "chat-2").unwrap();

        let user = repo.get_user_by_email("a@b.c").unwrap().unwrap();
        assert_eq!(user.chats, vec!["chat-1", "chat-2"]);
    }

    #[test]
    fn test_add_chat_to_missing_user_is_noop() {
        let repo = make_user_repo();
        repo.add_chat_to_user("ghost@b.c", "chat-1").unwrap();
        assert!(repo.get_user_by_email("ghost@b.c").unwrap().is_none());
    }
}
