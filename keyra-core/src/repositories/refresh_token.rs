use crate::{
    Error,
    crypto::TokenHash,
    storage::{FamilyId, RefreshFamily, RefreshTokenRecord, RotateOutcome},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository for refresh-token records and their families
#[async_trait]
pub trait RefreshTokenRepository: Send + Sync + 'static {
    /// Look up a refresh-token record by the hash of its raw token
    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<RefreshTokenRecord>, Error>;

    async fn find_family(&self, family_id: &FamilyId) -> Result<Option<RefreshFamily>, Error>;

    /// All records of a family, oldest generation first
    async fn find_by_family(&self, family_id: &FamilyId) -> Result<Vec<RefreshTokenRecord>, Error>;

    /// Replace the family's current token with `next` as one atomic unit.
    ///
    /// The swap only happens if `old` is still `Active` and the family is not
    /// revoked. On success `old` becomes `Rotated` with `rotated_at = now`,
    /// `next` is inserted, and the family head moves to `next`. Otherwise
    /// nothing changes and [`RotateOutcome::Conflict`] is returned. A failure
    /// part way through must leave `old` active.
    async fn rotate(
        &self,
        old: &TokenHash,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, Error>;

    /// Atomically revoke every record in the family, the family itself and the
    /// session that owns it. Idempotent; returns whether anything changed.
    async fn revoke_family(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<bool, Error>;

    /// Delete records that expired before `now`. Returns the number removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}
