use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    Error, RequestMetadata, Session, SessionId, User, UserId,
    config::SessionConfig,
    crypto::{RawToken, TokenCodec},
    error::{AuthError, SessionError},
    events::{Event, EventBus},
    repositories::{RefreshTokenRepository, SessionRepository, UserRepository},
    services::{retry::RetryPolicy, rotation::next_refresh_token},
    storage::{FamilyId, RefreshFamily},
    validation::normalize_email,
};

/// A freshly created session and the first token of its refresh family.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user: User,
    pub session: Session,
    pub refresh_token: RawToken,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Service for session lifecycle operations
pub struct SessionManager<S, T, U>
where
    S: SessionRepository,
    T: RefreshTokenRepository,
    U: UserRepository,
{
    sessions: Arc<S>,
    tokens: Arc<T>,
    users: Arc<U>,
    config: SessionConfig,
    events: EventBus,
    retry: RetryPolicy,
}

impl<S, T, U> SessionManager<S, T, U>
where
    S: SessionRepository,
    T: RefreshTokenRepository,
    U: UserRepository,
{
    pub fn new(sessions: Arc<S>, tokens: Arc<T>, users: Arc<U>, config: SessionConfig) -> Self {
        Self {
            sessions,
            tokens,
            users,
            config,
            events: EventBus::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a session for the owner of `email`, seeding its refresh family
    /// with one active token.
    ///
    /// The user is created on first login. Session, family and token are
    /// persisted in one atomic write.
    pub async fn create_session(
        &self,
        email: &str,
        metadata: &RequestMetadata,
    ) -> Result<NewSession, Error> {
        let email = normalize_email(email)?;
        let now = Utc::now();

        let users = &self.users;
        let address = email.as_str();
        let user = self
            .retry
            .run("user.find_or_create_verified", move || {
                users.find_or_create_verified(address, now)
            })
            .await?;

        let family_id = FamilyId::new_random();
        let session = Session {
            id: SessionId::new_random(),
            user_id: user.id.clone(),
            family_id: family_id.clone(),
            ip_address: metadata.ip_address.clone(),
            user_agent: metadata.user_agent.clone(),
            created_at: now,
            last_seen_at: now,
            expires_at: now + self.config.lifetime,
            revoked_at: None,
        };
        let (refresh_token, initial) = next_refresh_token(
            &family_id,
            0,
            self.config.refresh_token_ttl,
            session.expires_at,
            now,
        );
        let family = RefreshFamily {
            id: family_id,
            session_id: session.id.clone(),
            current_token_hash: initial.token_hash.clone(),
            generation: 0,
            created_at: now,
            revoked_at: None,
        };

        let sessions = &self.sessions;
        let (s, f, i) = (&session, &family, &initial);
        self.retry
            .run("session.create_with_family", move || {
                sessions.create_with_family(s, f, i)
            })
            .await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            family_id = %family.id,
            "Session created"
        );
        self.events
            .publish(Event::SessionCreated {
                user_id: user.id.clone(),
                session_id: session.id.clone(),
                family_id: family.id.clone(),
                ip_address: session.ip_address.clone(),
                timestamp: now,
            })
            .await;

        Ok(NewSession {
            user,
            session,
            refresh_token,
            refresh_expires_at: initial.expires_at,
        })
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, Error> {
        let sessions = &self.sessions;
        self.retry
            .run("session.find_by_id", move || sessions.find_by_id(session_id))
            .await
    }

    /// Like [`get_session`](Self::get_session) but only returns sessions
    /// that can still be used.
    pub async fn require_active(&self, session_id: &SessionId) -> Result<Session, Error> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or(Error::Session(SessionError::NotFound))?;

        if session.is_revoked() {
            return Err(Error::Session(SessionError::Revoked));
        }
        if session.is_expired_at(Utc::now()) {
            return Err(Error::Session(SessionError::Expired));
        }
        Ok(session)
    }

    /// True iff the session exists, is not revoked and is within its
    /// lifetime cap.
    pub async fn is_active(&self, session_id: &SessionId) -> Result<bool, Error> {
        Ok(self
            .get_session(session_id)
            .await?
            .is_some_and(|session| session.is_active_at(Utc::now())))
    }

    pub async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, Error> {
        let sessions = &self.sessions;
        self.retry
            .run("session.find_by_user", move || sessions.find_by_user(user_id))
            .await
    }

    /// Revoke a session and every refresh token in its family.
    ///
    /// Revoking an already revoked session succeeds without effect.
    pub async fn revoke(&self, session_id: &SessionId) -> Result<(), Error> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or(Error::Session(SessionError::NotFound))?;

        let now = Utc::now();
        let sessions = &self.sessions;
        let changed = self
            .retry
            .run("session.revoke", move || sessions.revoke(session_id, now))
            .await?;

        if changed {
            tracing::info!(session_id = %session_id, user_id = %session.user_id, "Session revoked");
            self.events
                .publish(Event::SessionRevoked {
                    session_id: session_id.clone(),
                    user_id: session.user_id,
                    timestamp: now,
                })
                .await;
        }
        Ok(())
    }

    /// Revoke every session of a user. Returns how many were revoked.
    pub async fn revoke_all_for_user(&self, user_id: &UserId) -> Result<u64, Error> {
        let now = Utc::now();
        let sessions = &self.sessions;
        let count = self
            .retry
            .run("session.revoke_all_for_user", move || {
                sessions.revoke_all_for_user(user_id, now)
            })
            .await?;

        tracing::info!(user_id = %user_id, count, "Revoked all sessions for user");
        self.events
            .publish(Event::SessionsRevokedForUser {
                user_id: user_id.clone(),
                count,
                timestamp: now,
            })
            .await;
        Ok(count)
    }

    /// Log out the session that owns a refresh token.
    ///
    /// Any record of the family will do, so a client holding a stale token
    /// can still end its session.
    pub async fn revoke_by_refresh_token(&self, raw: &str) -> Result<SessionId, Error> {
        let hash = TokenCodec::hash(raw);
        let tokens = &self.tokens;
        let h = &hash;
        let record = self
            .retry
            .run("refresh_token.find_by_hash", move || tokens.find_by_hash(h))
            .await?
            .ok_or(Error::Auth(AuthError::TokenUnknown))?;

        let family_id = &record.family_id;
        let family = self
            .retry
            .run("refresh_token.find_family", move || tokens.find_family(family_id))
            .await?
            .ok_or(Error::Auth(AuthError::TokenUnknown))?;

        self.revoke(&family.session_id).await?;
        Ok(family.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{
        InMemoryRepositoryProvider, RefreshTokenRepositoryAdapter, SessionRepositoryAdapter,
        UserRepositoryAdapter,
    };
    use crate::storage::RefreshTokenStatus;
    use chrono::Duration;

    type Manager = SessionManager<
        SessionRepositoryAdapter<InMemoryRepositoryProvider>,
        RefreshTokenRepositoryAdapter<InMemoryRepositoryProvider>,
        UserRepositoryAdapter<InMemoryRepositoryProvider>,
    >;

    type Tokens = RefreshTokenRepositoryAdapter<InMemoryRepositoryProvider>;

    fn manager_with(config: SessionConfig) -> (Manager, Arc<Tokens>) {
        let provider = Arc::new(InMemoryRepositoryProvider::new());
        let tokens = Arc::new(RefreshTokenRepositoryAdapter::new(provider.clone()));
        let manager = SessionManager::new(
            Arc::new(SessionRepositoryAdapter::new(provider.clone())),
            tokens.clone(),
            Arc::new(UserRepositoryAdapter::new(provider)),
            config,
        );
        (manager, tokens)
    }

    fn manager() -> (Manager, Arc<Tokens>) {
        manager_with(SessionConfig::default())
    }

    #[tokio::test]
    async fn test_create_session_seeds_family() {
        let (manager, tokens) = manager();
        let metadata = RequestMetadata::default().with_ip("10.0.0.1");

        let created = manager
            .create_session("User@Example.com", &metadata)
            .await
            .unwrap();

        assert_eq!(created.user.email, "user@example.com");
        assert!(created.user.is_email_verified());
        assert_eq!(created.session.user_id, created.user.id);
        assert_eq!(created.session.ip_address.as_deref(), Some("10.0.0.1"));
        assert!(manager.is_active(&created.session.id).await.unwrap());

        let records = tokens.find_by_family(&created.session.family_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].generation, 0);
        assert_eq!(records[0].status, RefreshTokenStatus::Active);
        assert_eq!(records[0].token_hash, created.refresh_token.hash());
    }

    #[tokio::test]
    async fn test_refresh_token_capped_by_session_lifetime() {
        let (manager, _) = manager_with(SessionConfig {
            lifetime: Duration::days(1),
            refresh_token_ttl: Duration::days(30),
            ..SessionConfig::default()
        });

        let created = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(created.refresh_expires_at, created.session.expires_at);
    }

    #[tokio::test]
    async fn test_returning_user_keeps_identity() {
        let (manager, _) = manager();
        let first = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();
        let second = manager
            .create_session("USER@example.com", &RequestMetadata::default())
            .await
            .unwrap();

        assert_eq!(first.user.id, second.user.id);
        assert_ne!(first.session.id, second.session.id);
        assert_eq!(manager.list_sessions(&first.user.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revoke_cascades_to_family() {
        let (manager, tokens) = manager();
        let created = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();

        manager.revoke(&created.session.id).await.unwrap();

        assert!(!manager.is_active(&created.session.id).await.unwrap());
        let family = tokens
            .find_family(&created.session.family_id)
            .await
            .unwrap()
            .unwrap();
        assert!(family.is_revoked());
        let record = tokens
            .find_by_hash(&created.refresh_token.hash())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RefreshTokenStatus::Revoked);

        // Idempotent
        manager.revoke(&created.session.id).await.unwrap();
        assert!(matches!(
            manager.require_active(&created.session.id).await,
            Err(Error::Session(SessionError::Revoked))
        ));
    }

    #[tokio::test]
    async fn test_revoke_unknown_session() {
        let (manager, _) = manager();
        let result = manager.revoke(&SessionId::new_random()).await;
        assert!(matches!(result, Err(Error::Session(SessionError::NotFound))));
        assert!(!manager.is_active(&SessionId::new_random()).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let (manager, _) = manager();
        let a = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();
        let b = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();
        let other = manager
            .create_session("other@example.com", &RequestMetadata::default())
            .await
            .unwrap();

        assert_eq!(manager.revoke_all_for_user(&a.user.id).await.unwrap(), 2);
        assert!(!manager.is_active(&a.session.id).await.unwrap());
        assert!(!manager.is_active(&b.session.id).await.unwrap());
        assert!(manager.is_active(&other.session.id).await.unwrap());

        assert_eq!(manager.revoke_all_for_user(&a.user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_by_refresh_token() {
        let (manager, _) = manager();
        let created = manager
            .create_session("user@example.com", &RequestMetadata::default())
            .await
            .unwrap();

        let revoked = manager
            .revoke_by_refresh_token(created.refresh_token.expose())
            .await
            .unwrap();
        assert_eq!(revoked, created.session.id);
        assert!(!manager.is_active(&created.session.id).await.unwrap());

        let unknown = manager.revoke_by_refresh_token("not-a-token").await;
        assert!(matches!(unknown, Err(Error::Auth(AuthError::TokenUnknown))));
    }

    #[tokio::test]
    async fn test_invalid_email_creates_nothing() {
        let (manager, _) = manager();
        let result = manager
            .create_session("not an email", &RequestMetadata::default())
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
