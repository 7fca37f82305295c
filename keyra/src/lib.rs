//! # Keyra
//!
//! Keyra is a passwordless authentication engine. Users log in by clicking a
//! single-use magic link sent to their email address and stay logged in with
//! rotating refresh tokens. Presenting a refresh token that has already been
//! exchanged is treated as theft: the whole token family and its session are
//! revoked.
//!
//! Keyra owns the credential state and nothing else. It does not serve HTTP;
//! the surrounding service calls the methods on [`Keyra`] and maps failures
//! onto responses with [`KeyraError::to_public`], which deliberately does not
//! reveal why a credential was refused.
//!
//! ## Storage Support
//!
//! - SQLite (feature `sqlite`, enabled by default)
//! - In-memory, for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use keyra::{KeyraBuilder, RequestMetadata};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let keyra = KeyraBuilder::new()
//!         .with_sqlite("sqlite://keyra.db")
//!         .await?
//!         .apply_migrations(true)
//!         .build()
//!         .await?;
//!
//!     let metadata = RequestMetadata::default().with_ip("203.0.113.7");
//!     let issued = keyra.issue_magic_link("user@example.com", &metadata).await?;
//!
//!     // ... the user clicks the link ...
//!     let login = keyra.verify_magic_link(issued.token.expose(), &metadata).await?;
//!     let refreshed = keyra
//!         .rotate_refresh(login.refresh_token.expose(), &metadata)
//!         .await?;
//!     println!("session {} at generation {}", refreshed.session.id, refreshed.generation);
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keyra_core::{
    events::EventBus,
    repositories::{
        MagicLinkRepository, MagicLinkRepositoryAdapter, RefreshTokenRepository,
        RefreshTokenRepositoryAdapter, RepositoryProvider, SessionRepository,
        SessionRepositoryAdapter, UserRepository, UserRepositoryAdapter,
    },
    services::{
        AccessTokenIssuer, MagicLinkIssuer, MagicLinkVerifier, RateLimiter, RefreshRotationEngine,
        SessionManager, ensure_sender_allowed,
    },
};

mod builder;

pub use builder::{KeyraBuilder, KeyraBuilderError, NoStorage, WithStorage};

/// Re-export core types from keyra_core
///
/// These types are commonly used when working with the Keyra API.
pub use keyra_core::{
    AuthError, Environment, Error, FamilyId, KeyraConfig, PublicError, RawToken, RequestMetadata,
    Session, SessionId, TokenCodec, User, UserId,
    config::{AccessTokenConfig, MagicLinkConfig, RateLimitConfig, SessionConfig},
    error::SessionError,
    events::{Event, EventHandler},
    services::{AccessClaims, AccessToken, DevLogSink, IssuedMagicLink, MagicLinkSender, RetryPolicy},
    storage::SweepReport,
};

#[cfg(feature = "mailer")]
pub use keyra_core::services::MailerSender;

#[cfg(feature = "mailer")]
pub use keyra_mailer::MailerConfig;

/// Re-export storage backends
#[cfg(feature = "sqlite")]
pub use keyra_storage_sqlite::{SqliteAuditLog, SqliteRepositoryProvider};

pub use keyra_core::repositories::InMemoryRepositoryProvider;

/// Errors that can occur when using Keyra.
#[derive(Debug, thiserror::Error)]
pub enum KeyraError {
    /// A credential operation failed. The inner error carries the precise
    /// reason for logging and audit.
    #[error(transparent)]
    Core(#[from] Error),
}

impl KeyraError {
    /// The inner error, for callers that need the precise reason.
    pub fn as_core(&self) -> &Error {
        match self {
            KeyraError::Core(e) => e,
        }
    }

    /// The undifferentiated form of this error, safe to show a client.
    pub fn to_public(&self) -> PublicError {
        self.as_core().to_public()
    }

    pub fn is_auth_error(&self) -> bool {
        self.as_core().is_auth_error()
    }

    pub fn is_retryable(&self) -> bool {
        self.as_core().is_retryable()
    }
}

/// The result of consuming a magic link: a new session and its first
/// credentials.
#[derive(Debug, Clone)]
pub struct Login {
    pub user: User,
    pub session: Session,
    pub refresh_token: RawToken,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_token: AccessToken,
}

/// The result of a successful refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub session: Session,
    pub refresh_token: RawToken,
    pub refresh_expires_at: DateTime<Utc>,
    pub generation: i64,
    pub access_token: AccessToken,
}

type Users<R> = UserRepositoryAdapter<R>;
type Sessions<R> = SessionRepositoryAdapter<R>;
type MagicLinks<R> = MagicLinkRepositoryAdapter<R>;
type RefreshTokens<R> = RefreshTokenRepositoryAdapter<R>;

/// The main entry point for Keyra.
///
/// Every method is safe to call concurrently, from any number of `Keyra`
/// instances sharing one store. The struct holds no session state of its own.
pub struct Keyra<R: RepositoryProvider> {
    repositories: Arc<R>,
    users: Arc<Users<R>>,
    magic_links: Arc<MagicLinks<R>>,
    refresh_tokens: Arc<RefreshTokens<R>>,
    sessions: Arc<Sessions<R>>,
    issuer: MagicLinkIssuer<MagicLinks<R>>,
    verifier: MagicLinkVerifier<MagicLinks<R>>,
    session_manager: SessionManager<Sessions<R>, RefreshTokens<R>, Users<R>>,
    rotation: RefreshRotationEngine<RefreshTokens<R>, Sessions<R>>,
    access_tokens: AccessTokenIssuer,
    rate_limiter: Arc<dyn RateLimiter>,
    events: EventBus,
    config: KeyraConfig,
}

impl<R: RepositoryProvider> Keyra<R> {
    /// Wire up every service over one repository provider.
    ///
    /// Most callers should use [`KeyraBuilder`], which also picks the
    /// delivery strategy and validates the configuration.
    ///
    /// Fails when a development-only sender is given a production
    /// configuration.
    pub fn new(
        repositories: Arc<R>,
        config: KeyraConfig,
        sender: Arc<dyn MagicLinkSender>,
        rate_limiter: Arc<dyn RateLimiter>,
        events: EventBus,
    ) -> Result<Self, KeyraError> {
        ensure_sender_allowed(sender.as_ref(), config.environment)?;

        let users = Arc::new(UserRepositoryAdapter::new(repositories.clone()));
        let magic_links = Arc::new(MagicLinkRepositoryAdapter::new(repositories.clone()));
        let refresh_tokens = Arc::new(RefreshTokenRepositoryAdapter::new(repositories.clone()));
        let sessions = Arc::new(SessionRepositoryAdapter::new(repositories.clone()));
        let retry = config.retry;

        let issuer = MagicLinkIssuer::new(magic_links.clone(), sender, config.magic_link.ttl)
            .with_rate_limiter(rate_limiter.clone())
            .with_event_bus(events.clone())
            .with_retry_policy(retry);

        let verifier = MagicLinkVerifier::new(magic_links.clone())
            .with_event_bus(events.clone())
            .with_retry_policy(retry);

        let session_manager = SessionManager::new(
            sessions.clone(),
            refresh_tokens.clone(),
            users.clone(),
            config.session.clone(),
        )
        .with_event_bus(events.clone())
        .with_retry_policy(retry);

        let rotation = RefreshRotationEngine::new(
            refresh_tokens.clone(),
            sessions.clone(),
            config.session.clone(),
        )
        .with_event_bus(events.clone())
        .with_retry_policy(retry);

        Ok(Self {
            access_tokens: AccessTokenIssuer::new(config.access_token.clone()),
            repositories,
            users,
            magic_links,
            refresh_tokens,
            sessions,
            issuer,
            verifier,
            session_manager,
            rotation,
            rate_limiter,
            events,
            config,
        })
    }

    pub fn config(&self) -> &KeyraConfig {
        &self.config
    }

    /// Run migrations for all repositories
    pub async fn migrate(&self) -> Result<(), KeyraError> {
        Ok(self.repositories.migrate().await?)
    }

    /// Health check for all repositories
    pub async fn health_check(&self) -> Result<(), KeyraError> {
        Ok(self.repositories.health_check().await?)
    }

    /// Subscribe a handler to every lifecycle and security event.
    pub async fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.events.register(handler).await;
    }

    /// Issue a magic link for `email` and hand it to the configured sender.
    ///
    /// The raw token is also returned so callers can deliver it themselves;
    /// never log it.
    pub async fn issue_magic_link(
        &self,
        email: &str,
        metadata: &RequestMetadata,
    ) -> Result<IssuedMagicLink, KeyraError> {
        Ok(self.issuer.issue(email, metadata).await?)
    }

    /// Consume a magic link and log its owner in.
    ///
    /// Creates the user on first login, then a session with a fresh refresh
    /// family, and mints the first access token.
    pub async fn verify_magic_link(
        &self,
        raw: &str,
        metadata: &RequestMetadata,
    ) -> Result<Login, KeyraError> {
        let verified = self.verifier.verify(raw).await?;
        let created = self
            .session_manager
            .create_session(&verified.email, metadata)
            .await?;
        let access_token = self.access_tokens.issue(&created.session)?;

        Ok(Login {
            user: created.user,
            session: created.session,
            refresh_token: created.refresh_token,
            refresh_expires_at: created.refresh_expires_at,
            access_token,
        })
    }

    /// Exchange a refresh token for the next one in its family.
    pub async fn rotate_refresh(
        &self,
        raw: &str,
        metadata: &RequestMetadata,
    ) -> Result<Refreshed, KeyraError> {
        let rotation = self.rotation.rotate(raw, metadata).await?;
        let access_token = self.access_tokens.issue(&rotation.session)?;

        Ok(Refreshed {
            session: rotation.session,
            refresh_token: rotation.refresh_token,
            refresh_expires_at: rotation.expires_at,
            generation: rotation.generation,
            access_token,
        })
    }

    /// Revoke a session and every refresh token of its family.
    pub async fn revoke_session(&self, session_id: &SessionId) -> Result<(), KeyraError> {
        Ok(self.session_manager.revoke(session_id).await?)
    }

    /// End the session that owns `refresh_token`.
    pub async fn logout(&self, refresh_token: &str) -> Result<SessionId, KeyraError> {
        Ok(self
            .session_manager
            .revoke_by_refresh_token(refresh_token)
            .await?)
    }

    /// Revoke every session of a user. Returns how many were revoked.
    pub async fn logout_all(&self, user_id: &UserId) -> Result<u64, KeyraError> {
        Ok(self.session_manager.revoke_all_for_user(user_id).await?)
    }

    pub async fn is_session_active(&self, session_id: &SessionId) -> Result<bool, KeyraError> {
        Ok(self.session_manager.is_active(session_id).await?)
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>, KeyraError> {
        Ok(self.session_manager.get_session(session_id).await?)
    }

    /// Sessions of a user, newest first, including revoked ones.
    pub async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, KeyraError> {
        Ok(self.session_manager.list_sessions(user_id).await?)
    }

    pub async fn get_user(&self, user_id: &UserId) -> Result<Option<User>, KeyraError> {
        Ok(self.users.find_by_id(user_id).await?)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, KeyraError> {
        let email = keyra_core::validation::normalize_email(email).map_err(Error::from)?;
        Ok(self.users.find_by_email(&email).await?)
    }

    /// Check an access token's signature and expiry.
    ///
    /// This is stateless: a token stays valid until it expires even if its
    /// session was revoked. Use [`authenticate`](Self::authenticate) when
    /// revocation must take effect immediately.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, KeyraError> {
        Ok(self.access_tokens.verify(token)?)
    }

    /// Verify an access token and require its session to still be active.
    pub async fn authenticate(&self, access_token: &str) -> Result<Session, KeyraError> {
        let claims = self.access_tokens.verify(access_token)?;
        Ok(self
            .session_manager
            .require_active(&claims.session_id())
            .await?)
    }

    /// Delete expired magic links, expired refresh records and sessions past
    /// their lifetime cap, and drop elapsed rate-limit windows.
    ///
    /// Purely housekeeping: every read already treats expired records as
    /// invalid, so skipping the sweep never weakens a check.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, KeyraError> {
        let report = SweepReport {
            magic_links: self.magic_links.cleanup_expired(now).await?,
            sessions: self.sessions.cleanup_expired(now).await?,
            refresh_tokens: self.refresh_tokens.cleanup_expired(now).await?,
        };
        let rate_limit_windows = self.rate_limiter.purge_expired(now).await;

        tracing::info!(
            magic_links = report.magic_links,
            refresh_tokens = report.refresh_tokens,
            sessions = report.sessions,
            rate_limit_windows,
            "Swept expired credentials"
        );
        self.events
            .publish(Event::ExpiredSwept {
                report,
                timestamp: now,
            })
            .await;

        Ok(report)
    }
}
