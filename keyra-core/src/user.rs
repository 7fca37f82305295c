//! Users are created on first successful magic-link login and identified by
//! their normalized email address.
use crate::id::prefixed_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

prefixed_id!(
    /// A unique, stable identifier for a user. Treat it as opaque.
    UserId,
    "usr"
);

impl Default for UserId {
    fn default() -> Self {
        Self::new_random()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Normalized email address, unique across users.
    pub email: String,
    /// Set when the user first proved control of the address.
    pub email_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A user verified at `now` by consuming a magic link.
    pub fn verified(email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: UserId::new_random(),
            email: email.into(),
            email_verified_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_email_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }
}
