//! SQLite storage backend for keyra
//!
//! Timestamps are stored as unix seconds. Every multi-record operation runs
//! inside a single transaction, and the check-and-set operations (consuming a
//! magic link, rotating a refresh token) are conditional `UPDATE`s whose
//! affected-row count decides the winner.
//!
//! ```rust,no_run
//! use keyra_core::repositories::RepositoryProvider;
//! use keyra_storage_sqlite::SqliteRepositoryProvider;
//!
//! # async fn run() -> Result<(), keyra_core::Error> {
//! let provider = SqliteRepositoryProvider::connect("sqlite://keyra.db?mode=rwc").await?;
//! provider.migrate().await?;
//! # Ok(())
//! # }
//! ```
mod audit;
pub mod migrations;
pub mod repositories;

pub use audit::SqliteAuditLog;
pub use repositories::SqliteRepositoryProvider;

use chrono::{DateTime, Utc};
use keyra_core::{Error, error::StorageError};
use sqlx::{Sqlite, SqlitePool, Transaction};

/// SQLite result codes for a busy or locked database
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Map a sqlx error onto the storage taxonomy, logging it on the way.
///
/// Pool exhaustion, I/O failures and lock contention are transient and may
/// be retried; everything else is surfaced as is.
pub(crate) fn db_error(operation: &'static str, e: sqlx::Error) -> Error {
    let transient = match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)
        ),
        _ => false,
    };

    if transient {
        tracing::warn!(error = %e, operation, "Transient database error");
        return Error::Storage(StorageError::Unavailable(e.to_string()));
    }

    tracing::error!(error = %e, operation, "Database error");
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Storage(StorageError::Constraint(e.to_string()))
        }
        _ => Error::Storage(StorageError::Database(e.to_string())),
    }
}

/// Start a transaction that takes the write lock up front.
///
/// A deferred transaction that reads before writing cannot wait for the lock
/// when another writer holds it, and fails with `SQLITE_BUSY` straight away.
/// `BEGIN IMMEDIATE` waits out the connection's busy timeout instead.
pub(crate) async fn begin_write(
    pool: &SqlitePool,
    operation: &'static str,
) -> Result<Transaction<'static, Sqlite>, Error> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| db_error(operation, e))
}

pub(crate) fn from_unix(secs: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        Error::Storage(StorageError::Database(format!("invalid timestamp: {secs}")))
    })
}

pub(crate) fn from_unix_opt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, Error> {
    secs.map(from_unix).transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use keyra_core::repositories::RepositoryProvider;
    use sqlx::sqlite::SqlitePoolOptions;

    /// A migrated in-memory database.
    ///
    /// Every connection to `sqlite::memory:` opens a separate database, so the
    /// pool is limited to one connection.
    pub(crate) async fn provider() -> SqliteRepositoryProvider {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let provider = SqliteRepositoryProvider::new(pool);
        provider.migrate().await.unwrap();
        provider
    }

    /// A migrated database file with a pool of several connections.
    pub(crate) async fn file_provider() -> (tempfile::TempDir, SqliteRepositoryProvider) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("keyra.db").display());
        let provider = SqliteRepositoryProvider::connect(&url).await.unwrap();
        provider.migrate().await.unwrap();
        (dir, provider)
    }

    #[test]
    fn test_from_unix() {
        assert_eq!(from_unix(0).unwrap().timestamp(), 0);
        assert!(from_unix(i64::MAX).is_err());
        assert_eq!(from_unix_opt(None).unwrap(), None);
    }
}
