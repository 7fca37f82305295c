//! Refresh-token rotation with reuse detection
//!
//! Every refresh token is single use. Presenting the current token of a
//! family exchanges it for the next generation. Presenting a token that has
//! already been exchanged means two parties hold the same credential, so the
//! whole family and its session are revoked and both parties must log in
//! again.
//!
//! ```text
//!   active ──rotate──▶ rotated
//!     │                  │
//!     └──────revoke──────┴──▶ revoked   (terminal)
//! ```
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    Error, RequestMetadata, Session,
    config::SessionConfig,
    crypto::{RawToken, TokenCodec, TokenHash},
    error::{AuthError, SessionError},
    events::{Event, EventBus},
    repositories::{RefreshTokenRepository, SessionRepository},
    services::retry::RetryPolicy,
    storage::{FamilyId, RefreshTokenRecord, RefreshTokenStatus, RotateOutcome},
};

/// The outcome of a successful rotation.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub session: Session,
    /// The new refresh token. Hand it to the client; never store it.
    pub refresh_token: RawToken,
    pub generation: i64,
    pub expires_at: DateTime<Utc>,
}

/// Build the next active record of a family.
///
/// The token never outlives the session that owns the family.
pub fn next_refresh_token(
    family_id: &FamilyId,
    generation: i64,
    ttl: Duration,
    session_expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (RawToken, RefreshTokenRecord) {
    let (raw, token_hash) = TokenCodec::generate();
    let record = RefreshTokenRecord {
        token_hash,
        family_id: family_id.clone(),
        generation,
        issued_at: now,
        expires_at: (now + ttl).min(session_expires_at),
        rotated_at: None,
        status: RefreshTokenStatus::Active,
    };
    (raw, record)
}

pub struct RefreshRotationEngine<T: RefreshTokenRepository, S: SessionRepository> {
    tokens: Arc<T>,
    sessions: Arc<S>,
    config: SessionConfig,
    events: EventBus,
    retry: RetryPolicy,
}

impl<T: RefreshTokenRepository, S: SessionRepository> RefreshRotationEngine<T, S> {
    pub fn new(tokens: Arc<T>, sessions: Arc<S>, config: SessionConfig) -> Self {
        Self {
            tokens,
            sessions,
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

    /// Exchange a refresh token for its successor.
    ///
    /// Errors:
    /// - [`AuthError::TokenUnknown`] when no record matches; nothing changes.
    /// - [`AuthError::FamilyRevoked`] when the family or session was revoked.
    /// - [`AuthError::ReuseDetected`] when the token was already rotated; the
    ///   family is revoked unless the reuse falls inside the grace period.
    /// - [`AuthError::TokenExpired`] when the token is past its expiry.
    /// - [`SessionError::Expired`] when the session is past its lifetime cap.
    /// - [`AuthError::ClientMismatch`] when client binding is enabled and the
    ///   request comes from another client; the family is revoked.
    /// - A retryable storage error when reuse was detected but the family
    ///   could not be revoked.
    pub async fn rotate(
        &self,
        raw: &str,
        metadata: &RequestMetadata,
    ) -> Result<Rotation, Error> {
        let hash = TokenCodec::hash(raw);
        let now = Utc::now();

        let Some(record) = self.find_record(&hash).await? else {
            tracing::warn!(token = hash.fingerprint(), "Unknown refresh token presented");
            return Err(Error::Auth(AuthError::TokenUnknown));
        };

        match record.status {
            RefreshTokenStatus::Revoked => {
                tracing::info!(
                    token = hash.fingerprint(),
                    family_id = %record.family_id,
                    "Revoked refresh token presented"
                );
                return Err(Error::Auth(AuthError::FamilyRevoked));
            }
            RefreshTokenStatus::Rotated => return Err(self.handle_reuse(&record, now).await),
            RefreshTokenStatus::Active => {}
        }

        if record.is_expired_at(now) {
            tracing::info!(
                token = hash.fingerprint(),
                family_id = %record.family_id,
                "Expired refresh token presented"
            );
            return Err(Error::Auth(AuthError::TokenExpired));
        }

        let session = self.owning_session(&record.family_id).await?;

        if session.is_revoked() {
            // The family should already be revoked with its session; make sure.
            self.revoke_family(&record.family_id, now).await?;
            return Err(Error::Auth(AuthError::FamilyRevoked));
        }
        if session.is_expired_at(now) {
            tracing::info!(session_id = %session.id, "Refresh attempted on expired session");
            return Err(Error::Session(SessionError::Expired));
        }

        if self.config.bind_client && !session.matches_client(metadata) {
            tracing::warn!(
                session_id = %session.id,
                family_id = %record.family_id,
                ip_address = ?metadata.ip_address,
                "Refresh from a different client, revoking session"
            );
            self.revoke_family(&record.family_id, now).await?;
            self.events
                .publish(Event::ClientMismatch {
                    session_id: session.id.clone(),
                    family_id: record.family_id.clone(),
                    ip_address: metadata.ip_address.clone(),
                    user_agent: metadata.user_agent.clone(),
                    timestamp: now,
                })
                .await;
            return Err(Error::Auth(AuthError::ClientMismatch));
        }

        let (refresh_token, next) = next_refresh_token(
            &record.family_id,
            record.generation + 1,
            self.config.refresh_token_ttl,
            session.expires_at,
            now,
        );

        let tokens = &self.tokens;
        let (old, next_ref) = (&hash, &next);
        let outcome = self
            .retry
            .run("refresh_token.rotate", move || tokens.rotate(old, next_ref, now))
            .await?;

        match outcome {
            RotateOutcome::Rotated(family) => {
                let sessions = &self.sessions;
                let session_id = &session.id;
                if let Err(e) = self
                    .retry
                    .run("session.touch", move || sessions.touch(session_id, now))
                    .await
                {
                    tracing::warn!(error = %e, session_id = %session.id, "Failed to record session activity");
                }

                tracing::info!(
                    session_id = %session.id,
                    family_id = %family.id,
                    generation = family.generation,
                    "Refresh token rotated"
                );
                self.events
                    .publish(Event::TokenRotated {
                        session_id: session.id.clone(),
                        family_id: family.id.clone(),
                        generation: family.generation,
                        timestamp: now,
                    })
                    .await;

                Ok(Rotation {
                    session: Session {
                        last_seen_at: now,
                        ..session
                    },
                    refresh_token,
                    generation: next.generation,
                    expires_at: next.expires_at,
                })
            }
            RotateOutcome::Conflict => {
                // Someone else changed the record since we read it.
                let current = self.find_record(&hash).await?;
                match current {
                    Some(current) if current.status == RefreshTokenStatus::Rotated => {
                        Err(self.handle_reuse(&current, now).await)
                    }
                    _ => Err(Error::Auth(AuthError::FamilyRevoked)),
                }
            }
        }
    }

    /// Revoke a family, its tokens and its session. Idempotent.
    pub async fn revoke_family(&self, family_id: &FamilyId, now: DateTime<Utc>) -> Result<bool, Error> {
        let tokens = &self.tokens;
        self.retry
            .run("refresh_token.revoke_family", move || {
                tokens.revoke_family(family_id, now)
            })
            .await
    }

    async fn find_record(&self, hash: &TokenHash) -> Result<Option<RefreshTokenRecord>, Error> {
        let tokens = &self.tokens;
        self.retry
            .run("refresh_token.find_by_hash", move || tokens.find_by_hash(hash))
            .await
    }

    /// A family whose session has disappeared cannot be refreshed.
    async fn owning_session(&self, family_id: &FamilyId) -> Result<Session, Error> {
        let tokens = &self.tokens;
        let family = self
            .retry
            .run("refresh_token.find_family", move || tokens.find_family(family_id))
            .await?
            .ok_or(Error::Auth(AuthError::FamilyRevoked))?;

        if family.is_revoked() {
            return Err(Error::Auth(AuthError::FamilyRevoked));
        }

        let sessions = &self.sessions;
        let session_id = &family.session_id;
        self.retry
            .run("session.find_by_id", move || sessions.find_by_id(session_id))
            .await?
            .ok_or(Error::Auth(AuthError::FamilyRevoked))
    }

    /// Handle presentation of a token that has already been rotated.
    ///
    /// Inside the grace period the presentation is refused but the family
    /// survives, so a client that lost a race against itself keeps its
    /// session. Outside it, the family and its session are revoked.
    ///
    /// Returns the error to hand back to the caller: [`AuthError::ReuseDetected`]
    /// once the incident is handled, or the storage error when the family
    /// could not be revoked. The token stays `rotated`, so presenting it
    /// again retries the revocation.
    async fn handle_reuse(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> Error {
        let within_grace = self.config.reuse_grace_period > Duration::zero()
            && record
                .rotated_at
                .is_some_and(|rotated_at| now - rotated_at <= self.config.reuse_grace_period);

        let tokens = &self.tokens;
        let family_id = &record.family_id;
        let session_id = match self
            .retry
            .run("refresh_token.find_family", move || tokens.find_family(family_id))
            .await
        {
            Ok(family) => family.map(|f| f.session_id),
            Err(e) => {
                tracing::warn!(error = %e, family_id = %record.family_id, "Failed to load family");
                None
            }
        };

        let outcome = if within_grace {
            tracing::warn!(
                family_id = %record.family_id,
                generation = record.generation,
                "Rotated refresh token presented within grace period"
            );
            Ok(false)
        } else {
            tracing::warn!(
                family_id = %record.family_id,
                generation = record.generation,
                session_id = ?session_id.as_ref().map(|id| id.as_str()),
                "Refresh token reuse detected, revoking family"
            );
            self.revoke_family(&record.family_id, now)
                .await
                .map(|_| true)
                .inspect_err(|e| {
                    tracing::error!(
                        error = %e,
                        family_id = %record.family_id,
                        "Failed to revoke family after reuse, family is still live"
                    );
                })
        };

        self.events
            .publish(Event::ReuseDetected {
                family_id: record.family_id.clone(),
                session_id,
                generation: record.generation,
                family_revoked: outcome.as_ref().is_ok_and(|revoked| *revoked),
                timestamp: now,
            })
            .await;

        match outcome {
            Ok(_) => Error::Auth(AuthError::ReuseDetected),
            Err(e) => e,
        }
    }
}
