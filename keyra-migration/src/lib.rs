//! Schema migrations for keyra storage backends
//!
//! A backend describes its schema as an ordered list of [`Migration`]s and
//! applies them through a [`MigrationManager`], which records what has been
//! applied in its own table.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Database;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Migration versions must be unique and ascending, found {found} after {previous}")]
    OutOfOrder { previous: i64, found: i64 },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[async_trait]
pub trait Migration<DB: Database>: Send + Sync {
    /// Execute the migration
    async fn up<'a>(&'a self, conn: &'a mut <DB as Database>::Connection) -> Result<()>;

    /// Rollback the migration
    async fn down<'a>(&'a self, conn: &'a mut <DB as Database>::Connection) -> Result<()>;

    /// Unique version number for ordering migrations
    fn version(&self) -> i64;

    /// Human readable name of the migration
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    /// Unix seconds
    pub applied_at: i64,
}

impl MigrationRecord {
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.applied_at, 0)
    }
}

/// Reject migration lists that would apply out of order.
pub fn check_order(versions: impl IntoIterator<Item = i64>) -> Result<()> {
    let mut previous: Option<i64> = None;
    for found in versions {
        if let Some(previous) = previous {
            if found <= previous {
                return Err(MigrationError::OutOfOrder { previous, found });
            }
        }
        previous = Some(found);
    }
    Ok(())
}

#[async_trait]
pub trait MigrationManager<DB: Database>: Send + Sync {
    fn get_migration_table_name(&self) -> &str {
        "_keyra_migrations"
    }

    /// Initialize migration tracking table
    async fn initialize(&self) -> Result<()>;

    /// Apply pending migrations in list order
    async fn up(&self, migrations: &[Box<dyn Migration<DB>>]) -> Result<()>;

    /// Roll back applied migrations in reverse list order
    async fn down(&self, migrations: &[Box<dyn Migration<DB>>]) -> Result<()>;

    /// Get list of applied migrations
    async fn get_applied_migrations(&self) -> Result<Vec<MigrationRecord>>;

    /// Check if specific migration was applied
    async fn is_applied(&self, version: i64) -> Result<bool>;

    /// Migrations from `migrations` that have not been applied yet.
    async fn pending<'a>(
        &self,
        migrations: &'a [Box<dyn Migration<DB>>],
    ) -> Result<Vec<&'a dyn Migration<DB>>> {
        let mut pending = Vec::new();
        for migration in migrations {
            if !self.is_applied(migration.version()).await? {
                pending.push(migration.as_ref());
            }
        }
        tracing::debug!(count = pending.len(), "Pending migrations");
        Ok(pending)
    }
}
