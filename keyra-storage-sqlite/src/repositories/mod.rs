//! Repository implementations for SQLite storage

pub mod magic_link;
pub mod refresh_token;
pub mod session;
pub mod user;

pub use magic_link::SqliteMagicLinkRepository;
pub use refresh_token::SqliteRefreshTokenRepository;
pub use session::SqliteSessionRepository;
pub use user::SqliteUserRepository;

use async_trait::async_trait;
use keyra_core::{
    Error,
    error::StorageError,
    repositories::{
        MagicLinkRepositoryProvider, RefreshTokenRepositoryProvider, RepositoryProvider,
        SessionRepositoryProvider, UserRepositoryProvider,
    },
};
use keyra_migration::MigrationManager;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};

use crate::{db_error, migrations::SqliteMigrationManager};

/// Repository provider implementation for SQLite
///
/// All repositories share one connection pool.
pub struct SqliteRepositoryProvider {
    pool: SqlitePool,
    user: Arc<SqliteUserRepository>,
    session: Arc<SqliteSessionRepository>,
    magic_link: Arc<SqliteMagicLinkRepository>,
    refresh_token: Arc<SqliteRefreshTokenRepository>,
}

impl SqliteRepositoryProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            user: Arc::new(SqliteUserRepository::new(pool.clone())),
            session: Arc::new(SqliteSessionRepository::new(pool.clone())),
            magic_link: Arc::new(SqliteMagicLinkRepository::new(pool.clone())),
            refresh_token: Arc::new(SqliteRefreshTokenRepository::new(pool.clone())),
            pool,
        }
    }

    /// Open a pool for `url`, creating the database file if needed.
    ///
    /// `sqlite::memory:` gets a single connection, since every connection
    /// to it would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| db_error("connect", e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| db_error("connect", e))?;

        tracing::debug!(url, max_connections, "Connected to SQLite");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl UserRepositoryProvider for SqliteRepositoryProvider {
    type UserRepo = SqliteUserRepository;

    fn user(&self) -> &Self::UserRepo {
        &self.user
    }
}

impl SessionRepositoryProvider for SqliteRepositoryProvider {
    type SessionRepo = SqliteSessionRepository;

    fn session(&self) -> &Self::SessionRepo {
        &self.session
    }
}

impl MagicLinkRepositoryProvider for SqliteRepositoryProvider {
    type MagicLinkRepo = SqliteMagicLinkRepository;

    fn magic_link(&self) -> &Self::MagicLinkRepo {
        &self.magic_link
    }
}

impl RefreshTokenRepositoryProvider for SqliteRepositoryProvider {
    type RefreshTokenRepo = SqliteRefreshTokenRepository;

    fn refresh_token(&self) -> &Self::RefreshTokenRepo {
        &self.refresh_token
    }
}

#[async_trait]
impl RepositoryProvider for SqliteRepositoryProvider {
    async fn migrate(&self) -> Result<(), Error> {
        let manager = SqliteMigrationManager::new(self.pool.clone());
        manager.initialize().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to initialize migrations");
            Error::Storage(StorageError::Migration(
                "Failed to initialize migrations".to_string(),
            ))
        })?;

        manager
            .up(&crate::migrations::all())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                Error::Storage(StorageError::Migration(e.to_string()))
            })?;

        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("health_check", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_migrate() {
        let provider = SqliteRepositoryProvider::connect("sqlite::memory:")
            .await
            .unwrap();
        provider.migrate().await.unwrap();
        // Migrating twice is a no-op.
        provider.migrate().await.unwrap();
        provider.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = SqliteRepositoryProvider::connect("postgres://nope").await;
        assert!(matches!(result, Err(ref e) if e.is_storage_error()));
    }
}
