//! Sessions
//!
//! A session is the long-lived authenticated relationship created when a
//! magic link is consumed. Each session owns exactly one refresh-token family.
//!
//! | Field          | Type               | Description                                              |
//! | -------------- | ------------------ | -------------------------------------------------------- |
//! | `id`           | `SessionId`        | Unique identifier for the session.                       |
//! | `user_id`      | `UserId`           | The user the session authenticates.                      |
//! | `family_id`    | `FamilyId`         | The refresh-token family owned by this session.          |
//! | `ip_address`   | `Option<String>`   | IP address of the client that created the session.       |
//! | `user_agent`   | `Option<String>`   | User agent of the client that created the session.       |
//! | `created_at`   | `DateTime`         | When the session was created.                            |
//! | `last_seen_at` | `DateTime`         | Last successful refresh.                                 |
//! | `expires_at`   | `DateTime`         | Absolute lifetime cap; rotation never extends it.        |
//! | `revoked_at`   | `Option<DateTime>` | Set once when the session is revoked; never cleared.     |
use crate::id::prefixed_id;
use crate::storage::FamilyId;
use crate::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

prefixed_id!(SessionId, "ses");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub family_id: FamilyId,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    /// Whether a request comes from the client recorded at session creation.
    ///
    /// Only attributes that were recorded are compared; a session created
    /// without an IP address accepts any IP address.
    pub fn matches_client(&self, metadata: &RequestMetadata) -> bool {
        fn matches(recorded: &Option<String>, presented: &Option<String>) -> bool {
            match recorded {
                Some(recorded) => presented.as_deref() == Some(recorded.as_str()),
                None => true,
            }
        }

        matches(&self.ip_address, &metadata.ip_address)
            && matches(&self.user_agent, &metadata.user_agent)
    }
}

/// Client attributes that accompany a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMetadata {
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
