//! Adapters exposing one repository of a shared [`RepositoryProvider`].
//!
//! Services hold `Arc<SomeRepository>`. The adapters let every service share
//! a single provider instead of each owning a separate backend handle.
use crate::{
    Error, Session, SessionId, User, UserId,
    crypto::TokenHash,
    repositories::{
        MagicLinkRepository, RefreshTokenRepository, RepositoryProvider, SessionRepository,
        UserRepository,
    },
    storage::{FamilyId, MagicLinkToken, RefreshFamily, RefreshTokenRecord, RotateOutcome},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct UserRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> UserRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> UserRepository for UserRepositoryAdapter<R> {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, Error> {
        self.provider.user().find_by_id(id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        self.provider.user().find_by_email(email).await
    }

    async fn find_or_create_verified(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        self.provider.user().find_or_create_verified(email, now).await
    }
}

pub struct SessionRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> SessionRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> SessionRepository for SessionRepositoryAdapter<R> {
    async fn create_with_family(
        &self,
        session: &Session,
        family: &RefreshFamily,
        initial: &RefreshTokenRecord,
    ) -> Result<(), Error> {
        self.provider
            .session()
            .create_with_family(session, family, initial)
            .await
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, Error> {
        self.provider.session().find_by_id(id).await
    }

    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Session>, Error> {
        self.provider.session().find_by_user(user_id).await
    }

    async fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), Error> {
        self.provider.session().touch(id, now).await
    }

    async fn revoke(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool, Error> {
        self.provider.session().revoke(id, now).await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        self.provider.session().revoke_all_for_user(user_id, now).await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.provider.session().cleanup_expired(now).await
    }
}

pub struct MagicLinkRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> MagicLinkRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> MagicLinkRepository for MagicLinkRepositoryAdapter<R> {
    async fn insert(&self, token: &MagicLinkToken) -> Result<(), Error> {
        self.provider.magic_link().insert(token).await
    }

    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<MagicLinkToken>, Error> {
        self.provider.magic_link().find_by_hash(hash).await
    }

    async fn consume(
        &self,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLinkToken>, Error> {
        self.provider.magic_link().consume(hash, now).await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.provider.magic_link().cleanup_expired(now).await
    }
}

pub struct RefreshTokenRepositoryAdapter<R: RepositoryProvider> {
    provider: Arc<R>,
}

impl<R: RepositoryProvider> RefreshTokenRepositoryAdapter<R> {
    pub fn new(provider: Arc<R>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<R: RepositoryProvider> RefreshTokenRepository for RefreshTokenRepositoryAdapter<R> {
    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<RefreshTokenRecord>, Error> {
        self.provider.refresh_token().find_by_hash(hash).await
    }

    async fn find_family(&self, family_id: &FamilyId) -> Result<Option<RefreshFamily>, Error> {
        self.provider.refresh_token().find_family(family_id).await
    }

    async fn find_by_family(&self, family_id: &FamilyId) -> Result<Vec<RefreshTokenRecord>, Error> {
        self.provider.refresh_token().find_by_family(family_id).await
    }

    async fn rotate(
        &self,
        old: &TokenHash,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, Error> {
        self.provider.refresh_token().rotate(old, next, now).await
    }

    async fn revoke_family(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<bool, Error> {
        self.provider.refresh_token().revoke_family(family_id, now).await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.provider.refresh_token().cleanup_expired(now).await
    }
}
