//! Repository contracts for chats and users.
//!
//! Both backend implementations present identical external semantics:
//! lossless message round-trips, read-back order equal to append order, and
//! a created chat that contains exactly its seed message.

use chrono::{DateTime, TimeZone, Utc};

use sibyl_core::error::{Result, SibylError};
use sibyl_core::types::{Chat, Message, Reference, Role, User, UserRole};

/// Persistence contract for conversation logs.
///
/// Implementations are selected once per process (see [`crate::provider`])
/// and shared across threads.
pub trait ChatRepository: Send + Sync {
    /// Allocate a new chat identifier, store metadata and the seed message,
    /// and return a Chat containing that one message.
    fn create_chat(&self, title: &str, first_message: &Message) -> Result<Chat>;

    /// Store a message, assigning a server timestamp when absent, and
    /// refresh the chat's `last_updated`. Fails with `NotFound` (writing
    /// nothing) if the chat does not exist. Returns the stored message.
    fn append_message(&self, chat_id: &str, message: &Message) -> Result<Message>;

    /// All messages for the chat, ascending chronological order.
    /// Fails with `NotFound` if the chat does not exist.
    fn get_messages(&self, chat_id: &str) -> Result<Vec<Message>>;

    fn get_chat_by_id(&self, chat_id: &str) -> Result<Option<Chat>>;
}

/// Persistence contract for registered users.
pub trait UserRepository: Send + Sync {
    /// Store a user record, idempotently: repeated calls with the same
    /// email never create a duplicate and return the stored record.
    fn create_user(&self, user: &User) -> Result<User>;

    fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Append a chat identifier to the user's owned list, skipping
    /// duplicates. A missing user is a silent no-op.
    fn add_chat_to_user(&self, email: &str, chat_id: &str) -> Result<()>;
}

// =============================================================================
// Row conversion helpers shared by both backends
// =============================================================================

pub(crate) fn role_from_str(s: &str) -> Result<Role> {
    match s {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "system" => Ok(Role::System),
        other => Err(SibylError::Storage(format!("Unknown role: {}", other))),
    }
}

pub(crate) fn user_role_from_str(s: &str) -> Result<UserRole> {
    match s {
        "user" => Ok(UserRole::User),
        "admin" => Ok(UserRole::Admin),
        other => Err(SibylError::Storage(format!("Unknown user role: {}", other))),
    }
}

pub(crate) fn user_role_to_str(role: UserRole) -> &'static str {
    match role {
        UserRole::User => "user",
        UserRole::Admin => "admin",
    }
}

/// Millisecond epoch for storage columns and sort-key prefixes.
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

pub(crate) fn source_docs_to_json(docs: &Option<Vec<Reference>>) -> Result<Option<String>> {
    match docs {
        Some(list) => Ok(Some(serde_json::to_string(list)?)),
        None => Ok(None),
    }
}

pub(crate) fn source_docs_from_json(json: Option<String>) -> Result<Option<Vec<Reference>>> {
    match json {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(role_from_str(role.as_str()).unwrap(), role);
        }
        assert!(role_from_str("bot").is_err());
    }

    #[test]
    fn test_user_role_round_trip() {
        for role in [UserRole::User, UserRole::Admin] {
            assert_eq!(user_role_from_str(user_role_to_str(role)).unwrap(), role);
        }
        assert!(user_role_from_str("owner").is_err());
    }

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now));
        // Sub-millisecond precision is truncated by the storage column.
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_source_docs_round_trip() {
        let docs = Some(vec![Reference {
            title: "Reference [1]".to_string(),
            url: "http://a".to_string(),
            pages: Some("1-2".to_string()),
        }]);
        let json = source_docs_to_json(&docs).unwrap();
        let back = source_docs_from_json(json).unwrap();
        assert_eq!(back, docs);

        assert_eq!(source_docs_from_json(None).unwrap(), None);
        assert_eq!(source_docs_to_json(&None).unwrap(), None);
    }
}
