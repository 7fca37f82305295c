use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    Error, RequestMetadata,
    crypto::{RawToken, TokenCodec, TokenHash},
    error::AuthError,
    events::{Event, EventBus},
    repositories::MagicLinkRepository,
    services::{
        delivery::MagicLinkSender,
        rate_limit::{self, NoRateLimit, RateLimiter},
        retry::RetryPolicy,
    },
    storage::MagicLinkToken,
    validation::normalize_email,
};

/// A magic link that has been persisted and handed to the sender.
///
/// The raw token is returned as well so the caller can deliver it by other
/// means. It must not be logged or stored.
#[derive(Debug, Clone)]
pub struct IssuedMagicLink {
    pub email: String,
    pub token: RawToken,
    pub expires_at: DateTime<Utc>,
}

/// The identity proven by consuming a magic link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMagicLink {
    pub email: String,
    pub consumed_at: DateTime<Utc>,
}

/// Issues single-use magic links
pub struct MagicLinkIssuer<M: MagicLinkRepository> {
    repository: Arc<M>,
    sender: Arc<dyn MagicLinkSender>,
    rate_limiter: Arc<dyn RateLimiter>,
    events: EventBus,
    retry: RetryPolicy,
    ttl: Duration,
}

impl<M: MagicLinkRepository> MagicLinkIssuer<M> {
    pub fn new(repository: Arc<M>, sender: Arc<dyn MagicLinkSender>, ttl: Duration) -> Self {
        Self {
            repository,
            sender,
            rate_limiter: Arc::new(NoRateLimit),
            events: EventBus::default(),
            retry: RetryPolicy::default(),
            ttl,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Issue a magic link for `email` and hand it to the sender.
    ///
    /// A delivery failure is returned to the caller, but the persisted link
    /// is kept and remains valid until it expires.
    pub async fn issue(
        &self,
        email: &str,
        metadata: &RequestMetadata,
    ) -> Result<IssuedMagicLink, Error> {
        let email = normalize_email(email)?;

        self.check_rate_limit(&rate_limit::email_key(&email)).await?;
        if let Some(ip) = &metadata.ip_address {
            self.check_rate_limit(&rate_limit::ip_key(ip)).await?;
        }

        let now = Utc::now();
        let expires_at = now + self.ttl;
        let (token, token_hash) = TokenCodec::generate();

        let record = MagicLinkToken {
            token_hash: token_hash.clone(),
            email: email.clone(),
            created_at: now,
            expires_at,
            consumed_at: None,
            request_ip: metadata.ip_address.clone(),
            request_user_agent: metadata.user_agent.clone(),
        };

        let repository = &self.repository;
        let record = &record;
        self.retry
            .run("magic_link.insert", move || repository.insert(record))
            .await?;

        if let Err(e) = self
            .sender
            .send_magic_link(&email, &token, expires_at)
            .await
        {
            tracing::error!(
                error = %e,
                email = %email,
                token = token_hash.fingerprint(),
                "Magic link delivery failed, link stays valid until expiry"
            );
            return Err(e);
        }

        tracing::info!(
            email = %email,
            token = token_hash.fingerprint(),
            %expires_at,
            "Magic link issued"
        );
        self.events
            .publish(Event::MagicLinkIssued {
                email: email.clone(),
                expires_at,
                ip_address: metadata.ip_address.clone(),
                timestamp: now,
            })
            .await;

        Ok(IssuedMagicLink {
            email,
            token,
            expires_at,
        })
    }

    async fn check_rate_limit(&self, key: &str) -> Result<(), Error> {
        if let Err(e) = self.rate_limiter.check(key).await {
            tracing::warn!(key, "Magic link issuance rate limited");
            self.events
                .publish(Event::RateLimited {
                    key: key.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            return Err(e);
        }
        Ok(())
    }
}

/// Verifies and consumes magic links
pub struct MagicLinkVerifier<M: MagicLinkRepository> {
    repository: Arc<M>,
    events: EventBus,
    retry: RetryPolicy,
}

impl<M: MagicLinkRepository> MagicLinkVerifier<M> {
    pub fn new(repository: Arc<M>) -> Self {
        Self {
            repository,
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

    /// Consume a magic link, returning the email it was issued for.
    ///
    /// Of any number of concurrent verifications of the same token, exactly
    /// one succeeds; the others fail with [`AuthError::TokenAlreadyUsed`].
    pub async fn verify(&self, raw: &str) -> Result<VerifiedMagicLink, Error> {
        let hash = TokenCodec::hash(raw);
        let now = Utc::now();

        let repository = &self.repository;
        let hash_ref = &hash;
        let record = self
            .retry
            .run("magic_link.find_by_hash", move || {
                repository.find_by_hash(hash_ref)
            })
            .await?;

        let Some(record) = record else {
            return Err(self.reject(&hash, AuthError::TokenNotFound).await);
        };
        if record.is_consumed() {
            return Err(self.reject(&hash, AuthError::TokenAlreadyUsed).await);
        }
        if record.is_expired_at(now) {
            return Err(self.reject(&hash, AuthError::TokenExpired).await);
        }

        let consumed = self
            .retry
            .run("magic_link.consume", move || repository.consume(hash_ref, now))
            .await?;

        match consumed {
            Some(token) => {
                tracing::info!(
                    email = %token.email,
                    token = hash.fingerprint(),
                    "Magic link consumed"
                );
                self.events
                    .publish(Event::MagicLinkConsumed {
                        email: token.email.clone(),
                        timestamp: now,
                    })
                    .await;

                Ok(VerifiedMagicLink {
                    email: token.email,
                    consumed_at: now,
                })
            }
            // Another verification consumed it between our read and our write.
            None => Err(self.reject(&hash, AuthError::TokenAlreadyUsed).await),
        }
    }

    async fn reject(&self, hash: &TokenHash, reason: AuthError) -> Error {
        match reason {
            AuthError::TokenAlreadyUsed => {
                tracing::warn!(token = hash.fingerprint(), "Magic link presented again after use")
            }
            _ => tracing::info!(token = hash.fingerprint(), %reason, "Magic link rejected"),
        }

        self.events
            .publish(Event::MagicLinkRejected {
                token_fingerprint: hash.fingerprint().to_string(),
                reason,
                timestamp: Utc::now(),
            })
            .await;

        Error::Auth(reason)
    }
}
