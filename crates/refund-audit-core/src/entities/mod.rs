//! Persistence layer.
//!
//! [`TaskStore`] holds task aggregates, [`RowStore`] the per-row checkpoints.
//! Both are implemented for [`SqliteStore`]; the controller is generic over
//! them so another backend only needs the two traits.
//!
//! All trait methods use `impl Future` in their signatures so no
//! `async-trait` boxing is needed on this hot path.
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves relative to the crate root at
//! compile time, so the schema is embedded into the binary. The database file
//! location is a runtime setting.

pub mod dao;
pub mod row;
pub mod task;

pub use dao::{RowRecord, SourceRecord, TaskRecord};
pub use row::{RowSnapshot, RowStore};
pub use task::{NewTask, TaskStore};

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::Result;

/// SQLite-backed task and row store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g.
    /// `"sqlite://refund_audit.db"` or `"sqlite::memory:"` for tests. An
    /// in-memory database lives on a single pooled connection that is never
    /// recycled, otherwise each connection would see its own empty database.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(url, in_memory, "review store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_runs_migrations_on_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("audit.db").display());

        let store = SqliteStore::connect(&url).await.expect("connect");
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('review_tasks', 'review_rows', 'source_rows')",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(count, 3);

        // Re-opening applies nothing new and keeps the schema.
        SqliteStore::connect(&url).await.expect("reconnect");
    }
}
