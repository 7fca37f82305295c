use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyra_core::{Error, User, UserId, repositories::UserRepository};
use sqlx::SqlitePool;

use crate::{db_error, from_unix, from_unix_opt};

pub struct SqliteUserRepository {
    pool: SqlitePool,
}

impl SqliteUserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SqliteUser {
    id: String,
    email: String,
    email_verified_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SqliteUser> for User {
    type Error = Error;

    fn try_from(row: SqliteUser) -> Result<Self, Self::Error> {
        Ok(User {
            id: UserId::new(&row.id),
            email: row.email,
            email_verified_at: from_unix_opt(row.email_verified_at)?,
            created_at: from_unix(row.created_at)?,
            updated_at: from_unix(row.updated_at)?,
        })
    }
}

const USER_COLUMNS: &str = "id, email, email_verified_at, created_at, updated_at";

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, Error> {
        let row = sqlx::query_as::<_, SqliteUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("user.find_by_id", e))?;

        row.map(User::try_from).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        let row = sqlx::query_as::<_, SqliteUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("user.find_by_email", e))?;

        row.map(User::try_from).transpose()
    }

    async fn find_or_create_verified(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        // A single upsert, so two first logins for one address cannot race
        // into two users.
        let row = sqlx::query_as::<_, SqliteUser>(&format!(
            r#"
            INSERT INTO users (id, email, email_verified_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3, ?3)
            ON CONFLICT (email) DO UPDATE SET
                updated_at = CASE WHEN users.email_verified_at IS NULL
                    THEN excluded.updated_at ELSE users.updated_at END,
                email_verified_at = COALESCE(users.email_verified_at, excluded.email_verified_at)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(UserId::new_random().as_str())
        .bind(email)
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("user.find_or_create_verified", e))?;

        User::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::provider;
    use keyra_core::repositories::UserRepositoryProvider;

    use super::*;

    #[tokio::test]
    async fn test_find_or_create_verified() {
        let provider = provider().await;
        let users = provider.user();
        let now = Utc::now();

        let created = users
            .find_or_create_verified("user@example.com", now)
            .await
            .unwrap();
        assert!(created.is_email_verified());
        assert_eq!(created.email, "user@example.com");

        let again = users
            .find_or_create_verified("user@example.com", now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(again.email_verified_at, created.email_verified_at);

        let by_email = users.find_by_email("user@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, created.id);
        let by_id = users.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(by_id.email, "user@example.com");

        assert!(users.find_by_email("nobody@example.com").await.unwrap().is_none());
    }
}
