use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    FamilyId, SessionId, UserId,
    error::{AuthError, EventError},
    storage::SweepReport,
};

/// Security-relevant occurrences in the credential lifecycle.
///
/// Events never carry raw tokens. Where a token has to be correlated, the
/// leading characters of its hash are used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    MagicLinkIssued {
        email: String,
        expires_at: DateTime<Utc>,
        ip_address: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A magic link was presented and refused.
    MagicLinkRejected {
        token_fingerprint: String,
        reason: AuthError,
        timestamp: DateTime<Utc>,
    },

    MagicLinkConsumed {
        email: String,
        timestamp: DateTime<Utc>,
    },

    SessionCreated {
        user_id: UserId,
        session_id: SessionId,
        family_id: FamilyId,
        ip_address: Option<String>,
        timestamp: DateTime<Utc>,
    },

    TokenRotated {
        session_id: SessionId,
        family_id: FamilyId,
        generation: i64,
        timestamp: DateTime<Utc>,
    },

    /// A refresh token that had already been rotated was presented again.
    ///
    /// `family_revoked` is false only when the presentation fell inside the
    /// configured reuse grace period.
    ReuseDetected {
        family_id: FamilyId,
        session_id: Option<SessionId>,
        generation: i64,
        family_revoked: bool,
        timestamp: DateTime<Utc>,
    },

    /// A refresh came from a client other than the one that created the session.
    ClientMismatch {
        session_id: SessionId,
        family_id: FamilyId,
        ip_address: Option<String>,
        user_agent: Option<String>,
        timestamp: DateTime<Utc>,
    },

    SessionRevoked {
        session_id: SessionId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    SessionsRevokedForUser {
        user_id: UserId,
        count: u64,
        timestamp: DateTime<Utc>,
    },

    RateLimited {
        key: String,
        timestamp: DateTime<Utc>,
    },

    ExpiredSwept {
        report: SweepReport,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::MagicLinkIssued { .. } => "magic_link_issued",
            Event::MagicLinkRejected { .. } => "magic_link_rejected",
            Event::MagicLinkConsumed { .. } => "magic_link_consumed",
            Event::SessionCreated { .. } => "session_created",
            Event::TokenRotated { .. } => "token_rotated",
            Event::ReuseDetected { .. } => "reuse_detected",
            Event::ClientMismatch { .. } => "client_mismatch",
            Event::SessionRevoked { .. } => "session_revoked",
            Event::SessionsRevokedForUser { .. } => "sessions_revoked_for_user",
            Event::RateLimited { .. } => "rate_limited",
            Event::ExpiredSwept { .. } => "expired_swept",
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Event::SessionCreated { user_id, .. }
            | Event::SessionRevoked { user_id, .. }
            | Event::SessionsRevokedForUser { user_id, .. } => Some(user_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::MagicLinkIssued { timestamp, .. }
            | Event::MagicLinkRejected { timestamp, .. }
            | Event::MagicLinkConsumed { timestamp, .. }
            | Event::SessionCreated { timestamp, .. }
            | Event::TokenRotated { timestamp, .. }
            | Event::ReuseDetected { timestamp, .. }
            | Event::ClientMismatch { timestamp, .. }
            | Event::SessionRevoked { timestamp, .. }
            | Event::SessionsRevokedForUser { timestamp, .. }
            | Event::RateLimited { timestamp, .. }
            | Event::ExpiredSwept { timestamp, .. } => *timestamp,
        }
    }

    /// Security incidents warrant louder logging than routine lifecycle events.
    pub fn is_security_incident(&self) -> bool {
        matches!(
            self,
            Event::ReuseDetected { .. }
                | Event::ClientMismatch { .. }
                | Event::MagicLinkRejected { .. }
        )
    }
}

/// Receives every event published on an [`EventBus`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &Event) -> Result<(), EventError>;
}

#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Deliver an event to every handler, stopping at the first failure.
    pub async fn emit(&self, event: &Event) -> Result<(), EventError> {
        for handler in self.handlers.read().await.iter() {
            handler.handle_event(event).await?;
        }

        Ok(())
    }

    /// Deliver an event to every handler, logging failures instead of
    /// returning them. Services use this so a broken audit sink cannot fail
    /// or alter the credential operation that produced the event.
    pub async fn publish(&self, event: Event) {
        for handler in self.handlers.read().await.iter() {
            if let Err(e) = handler.handle_event(&event).await {
                tracing::error!(error = %e, event = event.name(), "Event handler failed");
            }
        }
    }
}

/// Writes every event to the `keyra::audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditHandler;

#[async_trait]
impl EventHandler for TracingAuditHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), EventError> {
        let details =
            serde_json::to_string(event).map_err(|e| EventError::HandlerError(e.to_string()))?;

        if event.is_security_incident() {
            tracing::warn!(target: "keyra::audit", event = event.name(), %details, "Security event");
        } else {
            tracing::info!(target: "keyra::audit", event = event.name(), %details, "Audit event");
        }

        Ok(())
    }
}
