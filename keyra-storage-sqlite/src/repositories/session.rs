use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyra_core::{
    Error, Session, SessionId, UserId,
    repositories::SessionRepository,
    storage::{FamilyId, RefreshFamily, RefreshTokenRecord},
};
use sqlx::SqlitePool;

use super::refresh_token::{insert_token, revoke_family_in};
use crate::{begin_write, db_error, from_unix, from_unix_opt};

pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SqliteSession {
    id: String,
    user_id: String,
    family_id: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: i64,
    last_seen_at: i64,
    expires_at: i64,
    revoked_at: Option<i64>,
}

impl TryFrom<SqliteSession> for Session {
    type Error = Error;

    fn try_from(row: SqliteSession) -> Result<Self, Self::Error> {
        Ok(Session {
            id: SessionId::new(&row.id),
            user_id: UserId::new(&row.user_id),
            family_id: FamilyId::new(&row.family_id),
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: from_unix(row.created_at)?,
            last_seen_at: from_unix(row.last_seen_at)?,
            expires_at: from_unix(row.expires_at)?,
            revoked_at: from_unix_opt(row.revoked_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, family_id, ip_address, user_agent, created_at, last_seen_at, expires_at, revoked_at";

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create_with_family(
        &self,
        session: &Session,
        family: &RefreshFamily,
        initial: &RefreshTokenRecord,
    ) -> Result<(), Error> {
        let mut tx = begin_write(&self.pool, "session.create_with_family").await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, family_id, ip_address, user_agent, created_at, last_seen_at, expires_at, revoked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(session.id.as_str())
        .bind(session.user_id.as_str())
        .bind(session.family_id.as_str())
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.created_at.timestamp())
        .bind(session.last_seen_at.timestamp())
        .bind(session.expires_at.timestamp())
        .bind(session.revoked_at.map(|t| t.timestamp()))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("session.create_with_family", e))?;

        sqlx::query(
            r#"
            INSERT INTO refresh_families (id, session_id, current_token_hash, generation, created_at, revoked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(family.id.as_str())
        .bind(family.session_id.as_str())
        .bind(family.current_token_hash.as_str())
        .bind(family.generation)
        .bind(family.created_at.timestamp())
        .bind(family.revoked_at.map(|t| t.timestamp()))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("session.create_with_family", e))?;

        insert_token(&mut *tx, initial)
            .await
            .map_err(|e| db_error("session.create_with_family", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("session.create_with_family", e))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, Error> {
        let row = sqlx::query_as::<_, SqliteSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("session.find_by_id", e))?;

        row.map(Session::try_from).transpose()
    }

    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Session>, Error> {
        let rows = sqlx::query_as::<_, SqliteSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("session.find_by_user", e))?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE sessions SET last_seen_at = ?2 WHERE id = ?1 AND revoked_at IS NULL")
            .bind(id.as_str())
            .bind(now.timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("session.touch", e))?;

        Ok(())
    }

    async fn revoke(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut tx = begin_write(&self.pool, "session.revoke").await?;

        let family_id: Option<String> =
            sqlx::query_scalar("SELECT family_id FROM sessions WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("session.revoke", e))?;

        let Some(family_id) = family_id else {
            return Ok(false);
        };

        let changed = revoke_family_in(&mut *tx, &FamilyId::new(&family_id), now)
            .await
            .map_err(|e| db_error("session.revoke", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("session.revoke", e))?;

        Ok(changed)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut tx = begin_write(&self.pool, "session.revoke_all_for_user").await?;

        let families: Vec<String> = sqlx::query_scalar(
            "SELECT family_id FROM sessions WHERE user_id = ?1 AND revoked_at IS NULL",
        )
        .bind(user_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("session.revoke_all_for_user", e))?;

        let mut count = 0;
        for family_id in &families {
            if revoke_family_in(&mut *tx, &FamilyId::new(family_id), now)
                .await
                .map_err(|e| db_error("session.revoke_all_for_user", e))?
            {
                count += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("session.revoke_all_for_user", e))?;

        Ok(count)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let mut tx = begin_write(&self.pool, "session.cleanup_expired").await?;

        sqlx::query(
            r#"
            DELETE FROM refresh_tokens
            WHERE family_id IN (SELECT family_id FROM sessions WHERE expires_at < ?1)
            "#,
        )
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("session.cleanup_expired", e))?;

        sqlx::query(
            r#"
            DELETE FROM refresh_families
            WHERE session_id IN (SELECT id FROM sessions WHERE expires_at < ?1)
            "#,
        )
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("session.cleanup_expired", e))?;

        let removed = sqlx::query("DELETE FROM sessions WHERE expires_at < ?1")
            .bind(now.timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("session.cleanup_expired", e))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| db_error("session.cleanup_expired", e))?;

        Ok(removed)
    }
}
