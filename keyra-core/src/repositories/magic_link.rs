use crate::{Error, crypto::TokenHash, storage::MagicLinkToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository for magic-link records
#[async_trait]
pub trait MagicLinkRepository: Send + Sync + 'static {
    /// Persist a freshly issued, unconsumed magic link
    async fn insert(&self, token: &MagicLinkToken) -> Result<(), Error>;

    /// Look up a magic link by the hash of its raw token
    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<MagicLinkToken>, Error>;

    /// Atomically mark a magic link consumed.
    ///
    /// Succeeds for exactly one caller, and only while the link is
    /// unconsumed and unexpired at `now`. Returns the consumed record to
    /// the winner and `None` to everyone else.
    async fn consume(
        &self,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLinkToken>, Error>;

    /// Delete links that expired before `now`. Returns the number removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;
}
