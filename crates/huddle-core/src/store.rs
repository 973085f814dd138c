//! SQLite-backed store.
//!
//! The store is a pool of rusqlite connections. SQLite calls block, so every
//! unit of work runs on the blocking thread pool via [`Store::run`].

use crate::error::{ChatError, ChatResult};
use crate::migrations;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default number of pooled connections for file-backed stores.
pub const DEFAULT_POOL_SIZE: u32 = 8;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;";

/// Shared handle to the relational store.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) a file-backed store and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built or migrations fail.
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> ChatResult<Self> {
        let path = path.as_ref();
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(CONNECTION_PRAGMAS)
        });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        info!(path = %path.display(), pool_size, "Opened store");
        Self::with_pool(pool)
    }

    /// Create an in-memory store.
    ///
    /// Every SQLite in-memory connection is its own database, so the pool
    /// holds exactly one connection and never recycles it.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be built or migrations fail.
    pub fn memory() -> ChatResult<Self> {
        let manager =
            SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)?;

        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> ChatResult<Self> {
        let mut conn = pool.get()?;
        migrations::migrate(&mut *conn)?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Run a unit of work against one pooled connection on the blocking pool.
    ///
    /// The closure must not call back into the store; with the in-memory
    /// pool that would wait on the connection it already holds.
    ///
    /// # Errors
    ///
    /// Returns whatever the closure returns, or a store error if no
    /// connection could be obtained.
    pub async fn run<T, F>(&self, work: F) -> ChatResult<T>
    where
        F: FnOnce(&mut Connection) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            work(&mut *conn)
        })
        .await
        .map_err(ChatError::from)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_keeps_schema_across_calls() {
        let store = Store::memory().unwrap();

        store
            .run(|conn| {
                conn.execute(
                    "INSERT INTO users (id, username) VALUES (1, 'alice')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let name: String = store
            .run(|conn| {
                Ok(conn.query_row("SELECT username FROM users WHERE id = 1", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(name, "alice");
    }

    #[tokio::test]
    async fn test_closure_errors_propagate() {
        let store = Store::memory().unwrap();
        let result: ChatResult<()> = store
            .run(|_| Err(ChatError::Validation("nope".into())))
            .await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }
}
