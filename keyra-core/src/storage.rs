//! Persisted credential records
//!
//! None of these records ever hold a raw token. Tokens are referenced by
//! [`TokenHash`] only.
use crate::crypto::TokenHash;
use crate::error::{Error, StorageError};
use crate::id::prefixed_id;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

prefixed_id!(
    /// Identifies the lineage of refresh tokens descended from one login.
    FamilyId,
    "fam"
);

/// A single-use login credential sent to an email address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicLinkToken {
    pub token_hash: TokenHash,
    /// Normalized address the link was issued for.
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set exactly once, by the atomic consume.
    pub consumed_at: Option<DateTime<Utc>>,
    pub request_ip: Option<String>,
    pub request_user_agent: Option<String>,
}

impl MagicLinkToken {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenStatus {
    Active,
    Rotated,
    Revoked,
}

impl RefreshTokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTokenStatus::Active => "active",
            RefreshTokenStatus::Rotated => "rotated",
            RefreshTokenStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for RefreshTokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshTokenStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RefreshTokenStatus::Active),
            "rotated" => Ok(RefreshTokenStatus::Rotated),
            "revoked" => Ok(RefreshTokenStatus::Revoked),
            other => Err(Error::Storage(StorageError::Database(format!(
                "unknown refresh token status: {other}"
            )))),
        }
    }
}

/// One refresh token in a family's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_hash: TokenHash,
    pub family_id: FamilyId,
    /// Position in the chain, starting at 0 for the token issued at login.
    pub generation: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When this token was exchanged for its successor.
    pub rotated_at: Option<DateTime<Utc>>,
    pub status: RefreshTokenStatus,
}

impl RefreshTokenRecord {
    pub fn is_active(&self) -> bool {
        self.status == RefreshTokenStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// The head of a refresh-token chain.
///
/// At most one record per family is `Active` and, while the family is not
/// revoked, that record is the one named by `current_token_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshFamily {
    pub id: FamilyId,
    pub session_id: SessionId,
    pub current_token_hash: TokenHash,
    /// Generation of the current token. Strictly increases with each rotation.
    pub generation: i64,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshFamily {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Result of the atomic compare-and-swap performed by a rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The old token was still active and has been replaced. Carries the
    /// family as it stands after the rotation.
    Rotated(RefreshFamily),
    /// The old token was no longer active when the swap ran. Nothing changed.
    Conflict,
}

/// Counts reported by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub magic_links: u64,
    pub refresh_tokens: u64,
    pub sessions: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.magic_links + self.refresh_tokens + self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RefreshTokenStatus::Active,
            RefreshTokenStatus::Rotated,
            RefreshTokenStatus::Revoked,
        ] {
            assert_eq!(status.as_str().parse::<RefreshTokenStatus>().unwrap(), status);
        }
        assert!("expired".parse::<RefreshTokenStatus>().is_err());
    }

    #[test]
    fn test_magic_link_expiry_boundary() {
        let now = Utc::now();
        let token = MagicLinkToken {
            token_hash: TokenHash::from_hex("00"),
            email: "user@example.com".to_string(),
            created_at: now,
            expires_at: now,
            consumed_at: None,
            request_ip: None,
            request_user_agent: None,
        };
        assert!(!token.is_expired_at(now));
        assert!(token.is_expired_at(now + chrono::Duration::milliseconds(1)));
        assert!(!token.is_consumed());
    }

    #[test]
    fn test_sweep_report_total() {
        let report = SweepReport {
            magic_links: 2,
            refresh_tokens: 3,
            sessions: 1,
        };
        assert_eq!(report.total(), 6);
    }
}
