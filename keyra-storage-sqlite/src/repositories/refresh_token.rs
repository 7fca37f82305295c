use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyra_core::{
    Error, SessionId,
    crypto::TokenHash,
    repositories::RefreshTokenRepository,
    storage::{FamilyId, RefreshFamily, RefreshTokenRecord, RotateOutcome},
};
use sqlx::{SqliteConnection, SqlitePool};

use crate::{begin_write, db_error, from_unix, from_unix_opt};

pub struct SqliteRefreshTokenRepository {
    pool: SqlitePool,
}

impl SqliteRefreshTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SqliteRefreshToken {
    token_hash: String,
    family_id: String,
    generation: i64,
    issued_at: i64,
    expires_at: i64,
    rotated_at: Option<i64>,
    status: String,
}

impl TryFrom<SqliteRefreshToken> for RefreshTokenRecord {
    type Error = Error;

    fn try_from(row: SqliteRefreshToken) -> Result<Self, Self::Error> {
        Ok(RefreshTokenRecord {
            token_hash: TokenHash::from_hex(row.token_hash),
            family_id: FamilyId::new(&row.family_id),
            generation: row.generation,
            issued_at: from_unix(row.issued_at)?,
            expires_at: from_unix(row.expires_at)?,
            rotated_at: from_unix_opt(row.rotated_at)?,
            status: row.status.parse()?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SqliteRefreshFamily {
    id: String,
    session_id: String,
    current_token_hash: String,
    generation: i64,
    created_at: i64,
    revoked_at: Option<i64>,
}

impl TryFrom<SqliteRefreshFamily> for RefreshFamily {
    type Error = Error;

    fn try_from(row: SqliteRefreshFamily) -> Result<Self, Self::Error> {
        Ok(RefreshFamily {
            id: FamilyId::new(&row.id),
            session_id: SessionId::new(&row.session_id),
            current_token_hash: TokenHash::from_hex(row.current_token_hash),
            generation: row.generation,
            created_at: from_unix(row.created_at)?,
            revoked_at: from_unix_opt(row.revoked_at)?,
        })
    }
}

const TOKEN_COLUMNS: &str =
    "token_hash, family_id, generation, issued_at, expires_at, rotated_at, status";
const FAMILY_COLUMNS: &str =
    "id, session_id, current_token_hash, generation, created_at, revoked_at";

pub(crate) async fn insert_token(
    conn: &mut SqliteConnection,
    record: &RefreshTokenRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (token_hash, family_id, generation, issued_at, expires_at, rotated_at, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(record.token_hash.as_str())
    .bind(record.family_id.as_str())
    .bind(record.generation)
    .bind(record.issued_at.timestamp())
    .bind(record.expires_at.timestamp())
    .bind(record.rotated_at.map(|t| t.timestamp()))
    .bind(record.status.as_str())
    .execute(conn)
    .await?;
    Ok(())
}

/// Revoke a family's tokens, the family and its session. Must run inside the
/// caller's transaction. Returns whether any row changed.
pub(crate) async fn revoke_family_in(
    conn: &mut SqliteConnection,
    family_id: &FamilyId,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let tokens = sqlx::query(
        "UPDATE refresh_tokens SET status = 'revoked' WHERE family_id = ?1 AND status != 'revoked'",
    )
    .bind(family_id.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let families = sqlx::query(
        "UPDATE refresh_families SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
    )
    .bind(family_id.as_str())
    .bind(now.timestamp())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let sessions = sqlx::query(
        "UPDATE sessions SET revoked_at = ?2 WHERE family_id = ?1 AND revoked_at IS NULL",
    )
    .bind(family_id.as_str())
    .bind(now.timestamp())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(tokens + families + sessions > 0)
}

#[async_trait]
impl RefreshTokenRepository for SqliteRefreshTokenRepository {
    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<RefreshTokenRecord>, Error> {
        let row = sqlx::query_as::<_, SqliteRefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = ?1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("refresh_token.find_by_hash", e))?;

        row.map(RefreshTokenRecord::try_from).transpose()
    }

    async fn find_family(&self, family_id: &FamilyId) -> Result<Option<RefreshFamily>, Error> {
        let row = sqlx::query_as::<_, SqliteRefreshFamily>(&format!(
            "SELECT {FAMILY_COLUMNS} FROM refresh_families WHERE id = ?1"
        ))
        .bind(family_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("refresh_token.find_family", e))?;

        row.map(RefreshFamily::try_from).transpose()
    }

    async fn find_by_family(&self, family_id: &FamilyId) -> Result<Vec<RefreshTokenRecord>, Error> {
        let rows = sqlx::query_as::<_, SqliteRefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE family_id = ?1 ORDER BY generation"
        ))
        .bind(family_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("refresh_token.find_by_family", e))?;

        rows.into_iter().map(RefreshTokenRecord::try_from).collect()
    }

    async fn rotate(
        &self,
        old: &TokenHash,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, Error> {
        let mut tx = begin_write(&self.pool, "refresh_token.rotate").await?;

        // Compare-and-swap on the presented token. Losing here means another
        // rotation or a revocation got there first.
        let swapped = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status = 'rotated', rotated_at = ?3
            WHERE token_hash = ?1
              AND family_id = ?2
              AND status = 'active'
              AND EXISTS (
                  SELECT 1 FROM refresh_families
                  WHERE id = ?2 AND revoked_at IS NULL AND current_token_hash = ?1
              )
            "#,
        )
        .bind(old.as_str())
        .bind(next.family_id.as_str())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("refresh_token.rotate", e))?
        .rows_affected();

        if swapped == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("refresh_token.rotate", e))?;
            return Ok(RotateOutcome::Conflict);
        }

        insert_token(&mut *tx, next)
            .await
            .map_err(|e| db_error("refresh_token.rotate", e))?;

        let family = sqlx::query_as::<_, SqliteRefreshFamily>(&format!(
            r#"
            UPDATE refresh_families
            SET current_token_hash = ?2, generation = ?3
            WHERE id = ?1
            RETURNING {FAMILY_COLUMNS}
            "#
        ))
        .bind(next.family_id.as_str())
        .bind(next.token_hash.as_str())
        .bind(next.generation)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("refresh_token.rotate", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("refresh_token.rotate", e))?;

        Ok(RotateOutcome::Rotated(RefreshFamily::try_from(family)?))
    }

    async fn revoke_family(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut tx = begin_write(&self.pool, "refresh_token.revoke_family").await?;

        let changed = revoke_family_in(&mut *tx, family_id, now)
            .await
            .map_err(|e| db_error("refresh_token.revoke_family", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("refresh_token.revoke_family", e))?;

        Ok(changed)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?1")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("refresh_token.cleanup_expired", e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::provider;
    use chrono::Duration;
    use keyra_core::{
        RawToken, Session, TokenCodec,
        repositories::{
            RefreshTokenRepositoryProvider, SessionRepository, SessionRepositoryProvider,
            UserRepository, UserRepositoryProvider,
        },
        storage::RefreshTokenStatus,
    };

    use super::*;

    fn record(
        family_id: &FamilyId,
        generation: i64,
        now: DateTime<Utc>,
    ) -> (RawToken, RefreshTokenRecord) {
        let (raw, token_hash) = TokenCodec::generate();
        (
            raw,
            RefreshTokenRecord {
                token_hash,
                family_id: family_id.clone(),
                generation,
                issued_at: now,
                expires_at: now + Duration::days(30),
                rotated_at: None,
                status: RefreshTokenStatus::Active,
            },
        )
    }

    async fn seed(provider: &crate::SqliteRepositoryProvider) -> (Session, RefreshTokenRecord) {
        let now = Utc::now();
        let user = provider
            .user()
            .find_or_create_verified("user@example.com", now)
            .await
            .unwrap();
        let family_id = FamilyId::new_random();
        let session = Session {
            id: SessionId::new_random(),
            user_id: user.id,
            family_id: family_id.clone(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_seen_at: now,
            expires_at: now + Duration::days(30),
            revoked_at: None,
        };
        let (_, initial) = record(&family_id, 0, now);
        let family = RefreshFamily {
            id: family_id,
            session_id: session.id.clone(),
            current_token_hash: initial.token_hash.clone(),
            generation: 0,
            created_at: now,
            revoked_at: None,
        };
        provider
            .session()
            .create_with_family(&session, &family, &initial)
            .await
            .unwrap();
        (session, initial)
    }

    #[tokio::test]
    async fn test_rotate_swaps_head() {
        let provider = provider().await;
        let tokens = provider.refresh_token();
        let (session, initial) = seed(&provider).await;
        let now = Utc::now();

        let (_, next) = record(&session.family_id, 1, now);
        let outcome = tokens.rotate(&initial.token_hash, &next, now).await.unwrap();
        let family = match outcome {
            RotateOutcome::Rotated(family) => family,
            RotateOutcome::Conflict => panic!("expected rotation"),
        };
        assert_eq!(family.generation, 1);
        assert_eq!(family.current_token_hash, next.token_hash);

        let old = tokens.find_by_hash(&initial.token_hash).await.unwrap().unwrap();
        assert_eq!(old.status, RefreshTokenStatus::Rotated);
        assert!(old.rotated_at.is_some());

        // The superseded token can never win again.
        let (_, other) = record(&session.family_id, 2, now);
        assert_eq!(
            tokens.rotate(&initial.token_hash, &other, now).await.unwrap(),
            RotateOutcome::Conflict
        );
        assert!(tokens.find_by_hash(&other.token_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_swap() {
        let provider = provider().await;
        let tokens = provider.refresh_token();
        let (session, initial) = seed(&provider).await;
        let now = Utc::now();

        // Reusing generation 0 violates UNIQUE (family_id, generation) after
        // the old token was already marked rotated inside the transaction.
        let (_, clash) = record(&session.family_id, 0, now);
        let result = tokens.rotate(&initial.token_hash, &clash, now).await;
        assert!(result.is_err());

        let old = tokens.find_by_hash(&initial.token_hash).await.unwrap().unwrap();
        assert_eq!(old.status, RefreshTokenStatus::Active);
        let family = tokens.find_family(&session.family_id).await.unwrap().unwrap();
        assert_eq!(family.current_token_hash, initial.token_hash);
    }

    #[tokio::test]
    async fn test_revoke_family_cascades() {
        let provider = provider().await;
        let tokens = provider.refresh_token();
        let (session, initial) = seed(&provider).await;
        let now = Utc::now();

        assert!(tokens.revoke_family(&session.family_id, now).await.unwrap());
        assert!(!tokens.revoke_family(&session.family_id, now).await.unwrap());

        let revoked = tokens.find_by_hash(&initial.token_hash).await.unwrap().unwrap();
        assert_eq!(revoked.status, RefreshTokenStatus::Revoked);
        let stored = provider.session().find_by_id(&session.id).await.unwrap().unwrap();
        assert!(stored.is_revoked());

        let (_, next) = record(&session.family_id, 1, now);
        assert_eq!(
            tokens.rotate(&initial.token_hash, &next, now).await.unwrap(),
            RotateOutcome::Conflict
        );
    }
}
