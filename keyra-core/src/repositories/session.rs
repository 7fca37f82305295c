use crate::{
    Error, Session, SessionId, UserId,
    storage::{RefreshFamily, RefreshTokenRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository for session data access
#[async_trait]
pub trait SessionRepository: Send + Sync + 'static {
    /// Persist a new session together with its refresh family and the
    /// generation-0 token, all or nothing.
    async fn create_with_family(
        &self,
        session: &Session,
        family: &RefreshFamily,
        initial: &RefreshTokenRecord,
    ) -> Result<(), Error>;

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, Error>;

    /// Sessions of a user, newest first
    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Session>, Error>;

    /// Record activity on a session
    async fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), Error>;

    /// Atomically revoke the session, its family and every token in it.
    /// Idempotent; returns whether anything changed.
    async fn revoke(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool, Error>;

    /// Revoke every unrevoked session of a user. Returns how many were revoked.
    async fn revoke_all_for_user(&self, user_id: &UserId, now: DateTime<Utc>)
    -> Result<u64, Error>;

    /// Delete sessions past their lifetime cap along with their families and
    /// tokens. Returns the number of sessions removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}
