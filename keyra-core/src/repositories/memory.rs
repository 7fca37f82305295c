//! In-process storage backend.
//!
//! All four repositories share one mutex-guarded state, so every operation,
//! including the multi-record ones, is trivially atomic. Useful for tests and
//! single-process deployments that do not need durability.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error, Session, SessionId, User, UserId,
    crypto::TokenHash,
    error::StorageError,
    repositories::{
        MagicLinkRepository, MagicLinkRepositoryProvider, RefreshTokenRepository,
        RefreshTokenRepositoryProvider, RepositoryProvider, SessionRepository,
        SessionRepositoryProvider, UserRepository, UserRepositoryProvider,
    },
    storage::{
        FamilyId, MagicLinkToken, RefreshFamily, RefreshTokenRecord, RefreshTokenStatus,
        RotateOutcome,
    },
};

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    magic_links: HashMap<TokenHash, MagicLinkToken>,
    sessions: HashMap<SessionId, Session>,
    families: HashMap<FamilyId, RefreshFamily>,
    tokens: HashMap<TokenHash, RefreshTokenRecord>,
}

impl State {
    fn revoke_family(&mut self, family_id: &FamilyId, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        for record in self.tokens.values_mut() {
            if &record.family_id == family_id && record.status != RefreshTokenStatus::Revoked {
                record.status = RefreshTokenStatus::Revoked;
                changed = true;
            }
        }

        if let Some(family) = self.families.get_mut(family_id) {
            if family.revoked_at.is_none() {
                family.revoked_at = Some(now);
                changed = true;
            }

            if let Some(session) = self.sessions.get_mut(&family.session_id) {
                if session.revoked_at.is_none() {
                    session.revoked_at = Some(now);
                    changed = true;
                }
            }
        }

        changed
    }

    fn remove_family(&mut self, family_id: &FamilyId) {
        self.families.remove(family_id);
        self.tokens.retain(|_, record| &record.family_id != family_id);
    }
}

#[derive(Default)]
struct Store {
    state: Mutex<State>,
    failing_writes: AtomicU32,
}

impl Store {
    fn lock(&self) -> Result<MutexGuard<'_, State>, Error> {
        self.state
            .lock()
            .map_err(|_| Error::Storage(StorageError::Database("state lock poisoned".to_string())))
    }

    /// Fails the write if an injected failure is pending. Runs before any
    /// mutation so a failed write never leaves partial state behind.
    fn check_write(&self) -> Result<(), Error> {
        let pending = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        match pending {
            Ok(_) => Err(Error::Storage(StorageError::Unavailable(
                "injected write failure".to_string(),
            ))),
            Err(_) => Ok(()),
        }
    }
}

pub struct InMemoryRepositoryProvider {
    store: Arc<Store>,
    users: InMemoryUserRepository,
    sessions: InMemorySessionRepository,
    magic_links: InMemoryMagicLinkRepository,
    refresh_tokens: InMemoryRefreshTokenRepository,
}

impl Default for InMemoryRepositoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepositoryProvider {
    pub fn new() -> Self {
        let store = Arc::new(Store::default());
        Self {
            users: InMemoryUserRepository {
                store: store.clone(),
            },
            sessions: InMemorySessionRepository {
                store: store.clone(),
            },
            magic_links: InMemoryMagicLinkRepository {
                store: store.clone(),
            },
            refresh_tokens: InMemoryRefreshTokenRepository {
                store: store.clone(),
            },
            store,
        }
    }

    /// Make the next `count` write operations fail with a transient
    /// [`StorageError::Unavailable`] before touching any state.
    pub fn fail_next_writes(&self, count: u32) {
        self.store.failing_writes.store(count, Ordering::SeqCst);
    }
}

impl UserRepositoryProvider for InMemoryRepositoryProvider {
    type UserRepo = InMemoryUserRepository;

    fn user(&self) -> &Self::UserRepo {
        &self.users
    }
}

impl SessionRepositoryProvider for InMemoryRepositoryProvider {
    type SessionRepo = InMemorySessionRepository;

    fn session(&self) -> &Self::SessionRepo {
        &self.sessions
    }
}

impl MagicLinkRepositoryProvider for InMemoryRepositoryProvider {
    type MagicLinkRepo = InMemoryMagicLinkRepository;

    fn magic_link(&self) -> &Self::MagicLinkRepo {
        &self.magic_links
    }
}

impl RefreshTokenRepositoryProvider for InMemoryRepositoryProvider {
    type RefreshTokenRepo = InMemoryRefreshTokenRepository;

    fn refresh_token(&self) -> &Self::RefreshTokenRepo {
        &self.refresh_tokens
    }
}

#[async_trait]
impl RepositoryProvider for InMemoryRepositoryProvider {
    async fn migrate(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.store.lock().map(|_| ())
    }
}

pub struct InMemoryUserRepository {
    store: Arc<Store>,
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, Error> {
        Ok(self.store.lock()?.users.get(id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error> {
        Ok(self
            .store
            .lock()?
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_or_create_verified(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<User, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        if let Some(user) = state.users.values_mut().find(|user| user.email == email) {
            if user.email_verified_at.is_none() {
                user.email_verified_at = Some(now);
                user.updated_at = now;
            }
            return Ok(user.clone());
        }

        let user = User::verified(email, now);
        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }
}

pub struct InMemorySessionRepository {
    store: Arc<Store>,
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create_with_family(
        &self,
        session: &Session,
        family: &RefreshFamily,
        initial: &RefreshTokenRecord,
    ) -> Result<(), Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        if state.sessions.contains_key(&session.id)
            || state.families.contains_key(&family.id)
            || state.tokens.contains_key(&initial.token_hash)
        {
            return Err(Error::Storage(StorageError::Constraint(
                "duplicate session, family or token".to_string(),
            )));
        }

        state.sessions.insert(session.id.clone(), session.clone());
        state.families.insert(family.id.clone(), family.clone());
        state
            .tokens
            .insert(initial.token_hash.clone(), initial.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, Error> {
        Ok(self.store.lock()?.sessions.get(id).cloned())
    }

    async fn find_by_user(&self, user_id: &UserId) -> Result<Vec<Session>, Error> {
        let mut sessions: Vec<Session> = self
            .store
            .lock()?
            .sessions
            .values()
            .filter(|session| &session.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn touch(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), Error> {
        self.store.check_write()?;
        if let Some(session) = self.store.lock()?.sessions.get_mut(id) {
            session.last_seen_at = now;
        }
        Ok(())
    }

    async fn revoke(&self, id: &SessionId, now: DateTime<Utc>) -> Result<bool, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let Some(family_id) = state.sessions.get(id).map(|s| s.family_id.clone()) else {
            return Ok(false);
        };
        Ok(state.revoke_family(&family_id, now))
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<u64, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let families: Vec<FamilyId> = state
            .sessions
            .values()
            .filter(|s| &s.user_id == user_id && !s.is_revoked())
            .map(|s| s.family_id.clone())
            .collect();

        let mut count = 0;
        for family_id in families {
            if state.revoke_family(&family_id, now) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let expired: Vec<(SessionId, FamilyId)> = state
            .sessions
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| (s.id.clone(), s.family_id.clone()))
            .collect();

        for (session_id, family_id) in &expired {
            state.sessions.remove(session_id);
            state.remove_family(family_id);
        }
        Ok(expired.len() as u64)
    }
}

pub struct InMemoryMagicLinkRepository {
    store: Arc<Store>,
}

#[async_trait]
impl MagicLinkRepository for InMemoryMagicLinkRepository {
    async fn insert(&self, token: &MagicLinkToken) -> Result<(), Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        if state.magic_links.contains_key(&token.token_hash) {
            return Err(Error::Storage(StorageError::Constraint(
                "duplicate magic link".to_string(),
            )));
        }
        state
            .magic_links
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<MagicLinkToken>, Error> {
        Ok(self.store.lock()?.magic_links.get(hash).cloned())
    }

    async fn consume(
        &self,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<Option<MagicLinkToken>, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        match state.magic_links.get_mut(hash) {
            Some(token) if !token.is_consumed() && !token.is_expired_at(now) => {
                token.consumed_at = Some(now);
                Ok(Some(token.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let before = state.magic_links.len();
        state.magic_links.retain(|_, token| !token.is_expired_at(now));
        Ok((before - state.magic_links.len()) as u64)
    }
}

pub struct InMemoryRefreshTokenRepository {
    store: Arc<Store>,
}

#[async_trait]
impl RefreshTokenRepository for InMemoryRefreshTokenRepository {
    async fn find_by_hash(&self, hash: &TokenHash) -> Result<Option<RefreshTokenRecord>, Error> {
        Ok(self.store.lock()?.tokens.get(hash).cloned())
    }

    async fn find_family(&self, family_id: &FamilyId) -> Result<Option<RefreshFamily>, Error> {
        Ok(self.store.lock()?.families.get(family_id).cloned())
    }

    async fn find_by_family(&self, family_id: &FamilyId) -> Result<Vec<RefreshTokenRecord>, Error> {
        let mut records: Vec<RefreshTokenRecord> = self
            .store
            .lock()?
            .tokens
            .values()
            .filter(|record| &record.family_id == family_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.generation);
        Ok(records)
    }

    async fn rotate(
        &self,
        old: &TokenHash,
        next: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let swappable = match (state.tokens.get(old), state.families.get(&next.family_id)) {
            (Some(record), Some(family)) => {
                record.is_active()
                    && record.family_id == next.family_id
                    && !family.is_revoked()
                    && &family.current_token_hash == old
            }
            _ => false,
        };
        if !swappable {
            return Ok(RotateOutcome::Conflict);
        }

        if state.tokens.contains_key(&next.token_hash) {
            return Err(Error::Storage(StorageError::Constraint(
                "duplicate refresh token".to_string(),
            )));
        }

        if let Some(record) = state.tokens.get_mut(old) {
            record.status = RefreshTokenStatus::Rotated;
            record.rotated_at = Some(now);
        }
        state.tokens.insert(next.token_hash.clone(), next.clone());

        let family = state
            .families
            .get_mut(&next.family_id)
            .ok_or(Error::Storage(StorageError::NotFound))?;
        family.current_token_hash = next.token_hash.clone();
        family.generation = next.generation;

        Ok(RotateOutcome::Rotated(family.clone()))
    }

    async fn revoke_family(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<bool, Error> {
        self.store.check_write()?;
        Ok(self.store.lock()?.revoke_family(family_id, now))
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.store.check_write()?;
        let mut state = self.store.lock()?;

        let before = state.tokens.len();
        state.tokens.retain(|_, record| !record.is_expired_at(now));
        Ok((before - state.tokens.len()) as u64)
    }
}
