//! Per-connection cache of team memberships and blocks.

use crate::directory::Directory;
use crate::error::ChatResult;
use crate::model::{TeamId, UserId};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Team ids and blocked ids captured when a connection opens.
///
/// The snapshot never changes. Once it expires the connection is closed so
/// the client reconnects and a fresh snapshot is taken.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub user_id: UserId,
    pub team_ids: HashSet<TeamId>,
    pub blocked_ids: HashSet<UserId>,
    taken_at: Instant,
    ttl: Duration,
}

impl ConnectionSnapshot {
    /// Build a snapshot from already known sets.
    #[must_use]
    pub fn new(
        user_id: UserId,
        team_ids: HashSet<TeamId>,
        blocked_ids: HashSet<UserId>,
        ttl: Duration,
    ) -> Self {
        Self {
            user_id,
            team_ids,
            blocked_ids,
            taken_at: Instant::now(),
            ttl,
        }
    }

    /// Load a user's snapshot from the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory lookups fail.
    pub async fn load(directory: &dyn Directory, user_id: UserId, ttl: Duration) -> ChatResult<Self> {
        let team_ids = directory.team_ids(user_id).await?;
        let blocked_ids = directory.blocked_ids(user_id).await?;
        Ok(Self::new(user_id, team_ids, blocked_ids, ttl))
    }

    /// Whether this user has blocked `user_id`.
    #[must_use]
    pub fn has_blocked(&self, user_id: UserId) -> bool {
        self.blocked_ids.contains(&user_id)
    }

    /// Whether this user was on the team's roster at connect time.
    #[must_use]
    pub fn is_team_member(&self, team_id: TeamId) -> bool {
        self.team_ids.contains(&team_id)
    }

    /// When the snapshot stops being trusted.
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.taken_at + self.ttl
    }

    /// Whether team and block data should no longer be acted on.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::SqlDirectory;
    use crate::store::Store;

    #[tokio::test]
    async fn test_load_from_directory() {
        let directory = SqlDirectory::new(Store::memory().unwrap());
        directory.add_team_member(4, 1).await.unwrap();
        directory.block_user(1, 9).await.unwrap();

        let snapshot = ConnectionSnapshot::load(&directory, 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(snapshot.is_team_member(4));
        assert!(!snapshot.is_team_member(5));
        assert!(snapshot.has_blocked(9));
        assert!(!snapshot.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let snapshot =
            ConnectionSnapshot::new(1, HashSet::new(), HashSet::new(), Duration::from_secs(30));
        assert!(!snapshot.is_expired());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(snapshot.is_expired());
    }
}
