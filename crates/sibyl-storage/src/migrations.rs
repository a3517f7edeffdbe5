//! Database schema migrations, one set per storage backend.
//!
//! The two backends deliberately use different schemas: the embedded model
//! stores each chat's message list as a JSON document column, while the
//! partitioned model keys messages by `(chat_id, message_id)` for ordered
//! range scans. Both share the `schema_migrations` tracking table.

use rusqlite::Connection;
use tracing::info;

use sibyl_core::error::SibylError;

fn ensure_tracking_table(conn: &Connection) -> Result<i64, SibylError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| SibylError::Storage(format!("Failed to create migrations table: {}", e)))?;

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| SibylError::Storage(format!("Failed to query migration version: {}", e)))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), SibylError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )
    .map_err(|e| SibylError::Storage(format!("Failed to record migration: {}", e)))?;
    Ok(())
}

/// Run all pending migrations for the embedded-document backend.
pub fn run_embedded_migrations(conn: &Connection) -> Result<(), SibylError> {
    let current = ensure_tracking_table(conn)?;

    if current < 1 {
        conn.execute_batch(
            "
            -- A chat row physically owns its ordered message list.
            CREATE TABLE IF NOT EXISTS chats (
                id           TEXT PRIMARY KEY NOT NULL,
                title        TEXT NOT NULL DEFAULT '',
                messages     TEXT NOT NULL DEFAULT '[]',
                created_at   INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                email  TEXT PRIMARY KEY NOT NULL,
                name   TEXT NOT NULL DEFAULT '',
                role   TEXT NOT NULL DEFAULT 'user'
                       CHECK (role IN ('user', 'admin')),
                chats  TEXT NOT NULL DEFAULT '[]'
            );
            ",
        )
        .map_err(|e| SibylError::Storage(format!("Embedded migration v1 failed: {}", e)))?;
        record_migration(conn, 1, "embedded_initial_schema")?;
        info!("Applied migration v1: embedded_initial_schema");
    }

    Ok(())
}

/// Run all pending migrations for the partitioned backend.
pub fn run_partitioned_migrations(conn: &Connection) -> Result<(), SibylError> {
    let current = ensure_tracking_table(conn)?;

    if current < 1 {
        conn.execute_batch(
            "
            -- Chat metadata only; messages live in their own keyspace.
            CREATE TABLE IF NOT EXISTS chats (
                id           TEXT PRIMARY KEY NOT NULL,
                title        TEXT NOT NULL DEFAULT '',
                created_at   INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            );

            -- Composite key: message_id sorts ascending-chronological within
            -- a chat because it is prefixed by the millisecond timestamp.
            CREATE TABLE IF NOT EXISTS messages (
                chat_id     TEXT NOT NULL,
                message_id  TEXT NOT NULL,
                role        TEXT NOT NULL
                            CHECK (role IN ('user', 'assistant', 'system')),
                content     TEXT NOT NULL DEFAULT '',
                timestamp   INTEGER NOT NULL,
                source_docs TEXT,
                PRIMARY KEY (chat_id, message_id)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS users (
                email  TEXT PRIMARY KEY NOT NULL,
                name   TEXT NOT NULL DEFAULT '',
                role   TEXT NOT NULL DEFAULT 'user'
                       CHECK (role IN ('user', 'admin')),
                chats  TEXT NOT NULL DEFAULT '[]'
            );
            ",
        )
        .map_err(|e| SibylError::Storage(format!("Partitioned migration v1 failed: {}", e)))?;
        record_migration(conn, 1, "partitioned_initial_schema")?;
        info!("Applied migration v1: partitioned_initial_schema");
    }

    Ok(())
}
