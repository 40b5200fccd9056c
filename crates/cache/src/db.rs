//! Database connection and pool management.

use exn::ResultExt;
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::{Instrument, instrument};

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Readers run concurrently in WAL mode; writers still queue on SQLite's lock.
const MAX_CONNECTIONS: u32 = 5;

/// Database connection pool for the cache.
///
/// The entity store is the only shared mutable resource of the cache: every
/// write goes through [`transaction`](Self::transaction).
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, pool: SqlitePoolOptions) -> Result<Self> {
        let pool = pool
            // Apply the query-based PRAGMAs to EVERY connection the pool
            // opens, not only the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect to the cache database at the given path.
    ///
    /// Creates the database file (and its parent directory) if it doesn't
    /// exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Database)?;
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        Self::new(options, SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS)).await
    }

    /// Connect to an in-memory database (useful for testing).
    ///
    /// Note:
    /// - In-memory databases are destroyed when the connection closes.
    /// - Do NOT apply `#[cfg(test)]` so that other crates can also use this in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Parallel connections would each see their own empty database, and
        // a recycled connection would lose everything: keep exactly one,
        // forever.
        let pool = SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None);
        Self::new(options, pool).await
    }

    /// Base connection options shared between file and in-memory databases.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            // PRAGMA synchronous = NORMAL (balance between safety and speed)
            .synchronous(SqliteSynchronous::Normal)
            // A library sync rewrites thousands of flags in one transaction
            // while background fetches queue up behind it.
            .busy_timeout(std::time::Duration::from_millis(5000))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Run database migrations.
    ///
    /// This is called automatically by `connect` and `connect_in_memory`.
    #[instrument("performing database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` inside a single transaction.
    ///
    /// The transaction commits when `f` succeeds and rolls back when it
    /// fails (or when the returned future is dropped half-way). The closure
    /// must only capture owned data, since the future it returns borrows the
    /// connection alone:
    ///
    /// ```ignore
    /// db.transaction("rename artist", move |conn| Box::pin(async move {
    ///     sqlx::query("UPDATE artists SET name = ? WHERE id = ?")
    ///         .bind(name)
    ///         .bind(id)
    ///         .execute(&mut *conn)
    ///         .await
    ///         .or_raise(|| ErrorKind::Database)?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn transaction<R, F>(&self, name: &'static str, f: F) -> Result<R>
    where
        R: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<R>> + Send,
    {
        let span = tracing::debug_span!("transaction", name);
        async move {
            let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
            let result = f(&mut *tx).await?;
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Close the database connection pool.
    ///
    /// This waits for all connections to be returned to the pool and then
    /// closes them. After calling this, the Database instance should not
    /// be used.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_connect_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        let db = Database::connect(&path).await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        db.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_transaction_commits_on_success() {
        let db = Database::connect_in_memory().await.unwrap();
        db.transaction("insert", |conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO episode_positions (id, position_ms, fully_played, updated_at) VALUES ('e1', 10, 0, 0)")
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                Ok(())
            })
        })
        .await
        .unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episode_positions").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = Database::connect_in_memory().await.unwrap();
        let result: Result<()> = db
            .transaction("insert then fail", |conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO episode_positions (id, position_ms, fully_played, updated_at) VALUES ('e1', 10, 0, 0)")
                        .execute(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                    exn::bail!(ErrorKind::Validation("nope".to_string()))
                })
            })
            .await;
        assert_eq!(*result.unwrap_err(), ErrorKind::Validation("nope".to_string()));
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episode_positions").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 0);
    }
}
