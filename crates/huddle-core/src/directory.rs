//! Identity, team roster and block-list lookups.
//!
//! These records belong to the wider platform; the engine only reads them.
//! [`SqlDirectory`] reads them from the shared store and carries a few
//! write helpers for seeding.

use crate::clock;
use crate::error::ChatResult;
use crate::model::{TeamId, UserId, UserSummary};
use crate::store::Store;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

/// Read access to user identity, team rosters and block lists.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a user's public identity.
    async fn user(&self, user_id: UserId) -> ChatResult<Option<UserSummary>>;

    /// Teams the user currently belongs to.
    async fn team_ids(&self, user_id: UserId) -> ChatResult<HashSet<TeamId>>;

    /// Current roster of a team.
    async fn team_member_ids(&self, team_id: TeamId) -> ChatResult<Vec<UserId>>;

    /// Whether the user is on the team's roster.
    async fn is_team_member(&self, team_id: TeamId, user_id: UserId) -> ChatResult<bool>;

    /// Users the given user has blocked.
    async fn blocked_ids(&self, user_id: UserId) -> ChatResult<HashSet<UserId>>;

    /// Whether `blocker` has blocked `blocked`.
    async fn has_blocked(&self, blocker: UserId, blocked: UserId) -> ChatResult<bool>;
}

/// [`Directory`] backed by the `users`, `team_members` and `user_blocks`
/// tables.
#[derive(Debug, Clone)]
pub struct SqlDirectory {
    store: Store,
}

impl SqlDirectory {
    /// Create a directory over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert or update a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_user(
        &self,
        user_id: UserId,
        username: impl Into<String>,
        display_name: Option<String>,
    ) -> ChatResult<()> {
        let username = username.into();
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, username, display_name) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET username = excluded.username,
                                                   display_name = excluded.display_name",
                    params![user_id, username, display_name],
                )?;
                Ok(())
            })
            .await
    }

    /// Put a user on a team's roster.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn add_team_member(&self, team_id: TeamId, user_id: UserId) -> ChatResult<()> {
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO team_members (team_id, user_id) VALUES (?1, ?2)",
                    params![team_id, user_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Take a user off a team's roster.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn remove_team_member(&self, team_id: TeamId, user_id: UserId) -> ChatResult<()> {
        self.store
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM team_members WHERE team_id = ?1 AND user_id = ?2",
                    params![team_id, user_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Record that `blocker` blocks `blocked`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn block_user(&self, blocker: UserId, blocked: UserId) -> ChatResult<()> {
        self.store
            .run(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO user_blocks (blocker_id, blocked_id, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![blocker, blocked, clock::now_micros()],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn user(&self, user_id: UserId) -> ChatResult<Option<UserSummary>> {
        self.store
            .run(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, username, display_name FROM users WHERE id = ?1",
                        params![user_id],
                        |row| {
                            Ok(UserSummary {
                                id: row.get(0)?,
                                username: row.get(1)?,
                                display_name: row.get(2)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await
    }

    async fn team_ids(&self, user_id: UserId) -> ChatResult<HashSet<TeamId>> {
        self.store
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT team_id FROM team_members WHERE user_id = ?1")?;
                let ids = stmt
                    .query_map(params![user_id], |row| row.get(0))?
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    async fn team_member_ids(&self, team_id: TeamId) -> ChatResult<Vec<UserId>> {
        self.store
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id FROM team_members WHERE team_id = ?1 ORDER BY user_id",
                )?;
                let ids = stmt
                    .query_map(params![team_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    async fn is_team_member(&self, team_id: TeamId, user_id: UserId) -> ChatResult<bool> {
        self.store
            .run(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM team_members WHERE team_id = ?1 AND user_id = ?2)",
                    params![team_id, user_id],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    async fn blocked_ids(&self, user_id: UserId) -> ChatResult<HashSet<UserId>> {
        self.store
            .run(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT blocked_id FROM user_blocks WHERE blocker_id = ?1")?;
                let ids = stmt
                    .query_map(params![user_id], |row| row.get(0))?
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    async fn has_blocked(&self, blocker: UserId, blocked: UserId) -> ChatResult<bool> {
        self.store
            .run(move |conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM user_blocks WHERE blocker_id = ?1 AND blocked_id = ?2)",
                    params![blocker, blocked],
                    |row| row.get(0),
                )?)
            })
            .await
    }
}
