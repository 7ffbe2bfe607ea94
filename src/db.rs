//! SQLite store backing the persistent response cache.
//!
//! Opens the cache file in WAL mode so concurrent readers never block the
//! writer, and applies the schema under `migrations/` on open.
//!
//! # Example
//!
//! ```no_run
//! use chemfetch_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("chemfetch_cache.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Pool size for file-backed caches; SQLite serializes writers anyway.
const FILE_POOL_SIZE: u32 = 4;

/// How long a connection waits on a locked file before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures opening or migrating the cache store.
#[derive(Error, Debug)]
pub enum DbError {
    /// Connecting or running a statement failed.
    #[error("cache database unavailable: {0}")]
    Connection(#[from] sqlx::Error),

    /// Applying the schema failed.
    #[error("cache schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The parent directory of the cache file could not be created.
    #[error("cannot create cache directory {path}: {source}")]
    Directory {
        /// Directory that could not be created.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Pooled SQLite connection with the cache schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the cache file at `db_path` in WAL mode and
    /// applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection or migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await?;

        Self::migrated(pool).await
    }

    /// A private in-memory store. One connection, since every connection to
    /// `:memory:` would see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("cache schema up to date");
        Ok(Self { pool })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current journal mode, lower-cased (`wal`, `memory`, ...).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }

    /// Closes every pooled connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
