//! Versioned schema migrations.
//!
//! Each migration is applied atomically and recorded in `schema_version`.
//! The `users`, `team_members` and `user_blocks` tables belong to the wider
//! platform; they are created here so a standalone deployment has somewhere
//! to read identity, rosters and blocks from.

use crate::clock;
use rusqlite::{params, Connection};
use tracing::info;

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Migration descriptor.
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All migrations, in order.
#[must_use]
pub fn migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Conversations, participants, messages and collaborator tables",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT
            );

            CREATE TABLE IF NOT EXISTS team_members (
                team_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                PRIMARY KEY (team_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_team_members_user ON team_members(user_id);

            CREATE TABLE IF NOT EXISTS user_blocks (
                blocker_id INTEGER NOT NULL,
                blocked_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (blocker_id, blocked_id)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL CHECK(kind IN ('direct', 'group', 'team')),
                title TEXT,
                team_id INTEGER UNIQUE,
                direct_key TEXT UNIQUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK ((kind = 'team') = (team_id IS NOT NULL)),
                CHECK ((kind = 'direct') = (direct_key IS NOT NULL)),
                CHECK (title IS NULL OR kind = 'group')
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);

            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                joined_at INTEGER NOT NULL,
                last_read_at INTEGER,
                left_at INTEGER,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user
                ON conversation_participants(user_id) WHERE left_at IS NULL;

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER,
                team_id INTEGER,
                recipient_id INTEGER,
                sender_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                CHECK ((conversation_id IS NOT NULL) + (team_id IS NOT NULL) + (recipient_id IS NOT NULL) = 1),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at DESC, id DESC)
                WHERE conversation_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_messages_team ON messages(team_id) WHERE team_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient_id, sender_id) WHERE recipient_id IS NOT NULL;
        "#,
    }]
}

/// Current applied schema version (0 if none).
///
/// # Errors
///
/// Returns an error if the version table cannot be read.
pub fn current_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Apply every pending migration.
///
/// # Errors
///
/// Returns an error if any migration fails; that migration is rolled back.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let current = current_version(conn)?;

    for migration in migrations().into_iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, clock::now_micros()],
        )?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied migration"
        );
    }

    Ok(())
}
