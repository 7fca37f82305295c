use async_trait::async_trait;
use chrono::Utc;
use keyra_migration::{Migration, MigrationError, MigrationManager, MigrationRecord, check_order};
use sqlx::{Database, Sqlite, SqlitePool};

pub struct SqliteMigrationManager {
    pool: SqlitePool,
}

impl SqliteMigrationManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// The full schema, in application order.
pub fn all() -> Vec<Box<dyn Migration<Sqlite>>> {
    vec![
        Box::new(CreateUsersTable),
        Box::new(CreateMagicLinksTable),
        Box::new(CreateSessionsTable),
        Box::new(CreateRefreshFamiliesTable),
        Box::new(CreateRefreshTokensTable),
        Box::new(CreateAuditLogsTable),
        Box::new(CreateIndexes),
    ]
}

#[async_trait]
impl MigrationManager<Sqlite> for SqliteMigrationManager {
    async fn initialize(&self) -> Result<(), MigrationError> {
        sqlx::query(
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL DEFAULT (unixepoch())
            );"#,
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn up(&self, migrations: &[Box<dyn Migration<Sqlite>>]) -> Result<(), MigrationError> {
        check_order(migrations.iter().map(|m| m.version()))?;

        for migration in self.pending(migrations).await? {
            let mut tx = self.pool.begin().await?;

            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applying migration"
            );

            migration
                .up(&mut *tx as &mut <Sqlite as Database>::Connection)
                .await?;

            sqlx::query(
                format!(
                    "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
                    self.get_migration_table_name()
                )
                .as_str(),
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    async fn down(&self, migrations: &[Box<dyn Migration<Sqlite>>]) -> Result<(), MigrationError> {
        for migration in migrations.iter().rev() {
            if !self.is_applied(migration.version()).await? {
                continue;
            }

            let mut tx = self.pool.begin().await?;

            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Rolling back migration"
            );

            migration
                .down(&mut *tx as &mut <Sqlite as Database>::Connection)
                .await?;

            sqlx::query(
                format!(
                    "DELETE FROM {} WHERE version = ?",
                    self.get_migration_table_name()
                )
                .as_str(),
            )
            .bind(migration.version())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
        }
        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let records = sqlx::query_as::<_, MigrationRecord>(
            format!(
                "SELECT version, name, applied_at FROM {} ORDER BY version",
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn is_applied(&self, version: i64) -> Result<bool, MigrationError> {
        let result: bool = sqlx::query_scalar(
            format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE version = ?)",
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(result)
    }
}

/// Declare a migration made of plain SQL statements.
macro_rules! sql_migration {
    ($name:ident, $version:literal, up: [$($up:literal),+ $(,)?], down: [$($down:literal),+ $(,)?]) => {
        pub struct $name;

        #[async_trait]
        impl Migration<Sqlite> for $name {
            fn version(&self) -> i64 {
                $version
            }

            fn name(&self) -> &str {
                stringify!($name)
            }

            async fn up<'a>(
                &'a self,
                conn: &'a mut <Sqlite as Database>::Connection,
            ) -> Result<(), MigrationError> {
                $(sqlx::query($up).execute(&mut *conn).await?;)+
                Ok(())
            }

            async fn down<'a>(
                &'a self,
                conn: &'a mut <Sqlite as Database>::Connection,
            ) -> Result<(), MigrationError> {
                $(sqlx::query($down).execute(&mut *conn).await?;)+
                Ok(())
            }
        }
    };
}

sql_migration!(
    CreateUsersTable,
    1,
    up: [r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            email_verified_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );"#],
    down: ["DROP TABLE IF EXISTS users"]
);

sql_migration!(
    CreateMagicLinksTable,
    2,
    up: [r#"
        CREATE TABLE IF NOT EXISTS magic_links (
            token_hash TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            consumed_at INTEGER,
            request_ip TEXT,
            request_user_agent TEXT
        );"#],
    down: ["DROP TABLE IF EXISTS magic_links"]
);

sql_migration!(
    CreateSessionsTable,
    3,
    up: [r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            family_id TEXT NOT NULL UNIQUE,
            ip_address TEXT,
            user_agent TEXT,
            created_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            revoked_at INTEGER,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );"#],
    down: ["DROP TABLE IF EXISTS sessions"]
);

sql_migration!(
    CreateRefreshFamiliesTable,
    4,
    up: [r#"
        CREATE TABLE IF NOT EXISTS refresh_families (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL UNIQUE,
            current_token_hash TEXT NOT NULL,
            generation INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            revoked_at INTEGER,
            FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );"#],
    down: ["DROP TABLE IF EXISTS refresh_families"]
);

sql_migration!(
    CreateRefreshTokensTable,
    5,
    up: [
        r#"
        CREATE TABLE IF NOT EXISTS refresh_tokens (
            token_hash TEXT PRIMARY KEY,
            family_id TEXT NOT NULL,
            generation INTEGER NOT NULL,
            issued_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            rotated_at INTEGER,
            status TEXT NOT NULL CHECK (status IN ('active', 'rotated', 'revoked')),
            UNIQUE (family_id, generation),
            FOREIGN KEY (family_id) REFERENCES refresh_families(id) ON DELETE CASCADE
        );"#,
        // At most one active token per family, enforced by the database.
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_refresh_tokens_one_active
            ON refresh_tokens(family_id) WHERE status = 'active';"#,
    ],
    down: [
        "DROP INDEX IF EXISTS idx_refresh_tokens_one_active",
        "DROP TABLE IF EXISTS refresh_tokens",
    ]
);

sql_migration!(
    CreateAuditLogsTable,
    6,
    up: [r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event TEXT NOT NULL,
            user_id TEXT,
            details TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );"#],
    down: ["DROP TABLE IF EXISTS audit_logs"]
);

sql_migration!(
    CreateIndexes,
    7,
    up: [
        "CREATE INDEX IF NOT EXISTS idx_magic_links_expires_at ON magic_links(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_refresh_tokens_expires_at ON refresh_tokens(expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_user_id ON audit_logs(user_id)",
    ],
    down: [
        "DROP INDEX IF EXISTS idx_audit_logs_user_id",
        "DROP INDEX IF EXISTS idx_refresh_tokens_expires_at",
        "DROP INDEX IF EXISTS idx_sessions_expires_at",
        "DROP INDEX IF EXISTS idx_sessions_user_id",
        "DROP INDEX IF EXISTS idx_magic_links_expires_at",
    ]
);
