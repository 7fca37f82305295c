use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyra_core::{
    Error, crypto::TokenHash, repositories::MagicLinkRepository, storage::MagicLinkToken,
};
use sqlx::SqlitePool;

use crate::{db_error, from_unix, from_unix_opt};

pub struct SqliteMagicLinkRepository {
    pool: SqlitePool,
}

impl SqliteMagicLinkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SqliteMagicLink {
    token_hash: String,
    email: String,
    created_at: i64,
    expires_at: i64,
    consumed_at: Option<i64>,
    request_ip: Option<String>,
    request_user_agent: Option<String>,
}

impl TryFrom<SqliteMagicLink> for MagicLinkToken {
    type Error = Error;

    fn try_from(row: SqliteMagicLink) -> Result<Self, Self::Error> {
        Ok(MagicLinkToken {
            token_hash: TokenHash::from_hex(row.token_hash),
            email: row.email,
            created_at: from_unix(row.created_at)?,
            expires_at: from_unix(row.expires_at)?,
            consumed_at: from_unix_opt(row.consumed_at)?,
            request_ip: row.request_ip,
            request_user_agent: row.request_user_agent,
        })
    }
}

const MAGIC_LINK_COLUMNS: &str =
    "token_hash, email, created_at, expires_at, consumed_at, request_ip, request_user_agent";

#[async_trait]
impl MagicLinkRepository for SqliteMagicLinkRepository {
    async fn insert(&self, token: &MagicLinkToken) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO magic_links (token_hash, email, created_at, expires_at, consumed_at, request_ip, request_user_agent)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(token.token_hash.as_str())
        .bind(&token.email)
        .bind(token.created_at.timestamp())
        .bind(token.expires_at.timestamp())
        .bind(token.consumed_at.map(|t| t.timestamp()))
        .bind(&token.request_ip)
        .bind(&token.request_user_agent)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("magic_link.insert", e))?;

        Ok(())
    }

    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<MagicLinkToken>, Error> {
        let row = sqlx::query_as::<_, SqliteMagicLink>(&format!(
            "SELECT {MAGIC_LINK_COLUMNS} FROM magic_links WHERE token_hash = ?1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("magic_link.find_by_hash", e))?;

        row.map(MagicLinkToken::try_from).transpose()
    }

    async fn consume(
        &self,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLinkToken>, Error> {
        // The WHERE clause is the check; only one statement can flip
        // consumed_at from NULL.
        let row = sqlx::query_as::<_, SqliteMagicLink>(&format!(
            r#"
            UPDATE magic_links
            SET consumed_at = ?2
            WHERE token_hash = ?1 AND consumed_at IS NULL AND expires_at >= ?2
            RETURNING {MAGIC_LINK_COLUMNS}
            "#
        ))
        .bind(hash.as_str())
        .bind(now.timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("magic_link.consume", e))?;

        row.map(MagicLinkToken::try_from).transpose()
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM magic_links WHERE expires_at < ?1")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("magic_link.cleanup_expired", e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::provider;
    use chrono::Duration;
    use keyra_core::{TokenCodec, repositories::MagicLinkRepositoryProvider};

    use super::*;

    fn link(hash: TokenHash, now: DateTime<Utc>, ttl: Duration) -> MagicLinkToken {
        MagicLinkToken {
            token_hash: hash,
            email: "user@example.com".to_string(),
            created_at: now,
            expires_at: now + ttl,
            consumed_at: None,
            request_ip: Some("127.0.0.1".to_string()),
            request_user_agent: None,
        }
    }

    #[tokio::test]
    async fn test_consume_once() {
        let provider = provider().await;
        let links = provider.magic_link();
        let now = Utc::now();
        let (_, hash) = TokenCodec::generate();

        links.insert(&link(hash.clone(), now, Duration::minutes(15))).await.unwrap();

        let stored = links.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(stored.request_ip.as_deref(), Some("127.0.0.1"));
        assert!(!stored.is_consumed());

        let consumed = links.consume(&hash, now).await.unwrap().unwrap();
        assert!(consumed.is_consumed());
        assert!(links.consume(&hash, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_link_cannot_be_consumed() {
        let provider = provider().await;
        let links = provider.magic_link();
        let now = Utc::now();
        let (_, hash) = TokenCodec::generate();

        links.insert(&link(hash.clone(), now, Duration::minutes(-1))).await.unwrap();
        assert!(links.consume(&hash, now).await.unwrap().is_none());

        assert_eq!(links.cleanup_expired(now).await.unwrap(), 1);
        assert!(links.find_by_hash(&hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let provider = provider().await;
        let links = provider.magic_link();
        let now = Utc::now();
        let (_, hash) = TokenCodec::generate();

        links.insert(&link(hash.clone(), now, Duration::minutes(15))).await.unwrap();
        let result = links.insert(&link(hash, now, Duration::minutes(15))).await;
        assert!(matches!(result, Err(ref e) if e.is_storage_error()));
    }
}
