use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),
}

/// Failures while presenting a credential.
///
/// These are the internal, differentiated reasons. They are logged and
/// audited as-is, but callers facing the outside world should collapse them
/// with [`Error::to_public`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthError {
    #[error("Token not found")]
    TokenNotFound,

    #[error("Token not recognized")]
    TokenUnknown,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token already used")]
    TokenAlreadyUsed,

    #[error("Refresh token reuse detected")]
    ReuseDetected,

    #[error("Token family revoked")]
    FamilyRevoked,

    #[error("Client does not match the session")]
    ClientMismatch,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,

    #[error("Session revoked")]
    Revoked,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    /// Transient failure; the operation did not take effect and may be retried.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Record not found")]
    NotFound,

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid email format: {0}")]
    InvalidEmail(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event handler error: {0}")]
    HandlerError(String),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Access token signing failed: {0}")]
    AccessTokenSigning(String),

    #[error("Access token verification failed: {0}")]
    AccessTokenVerification(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Magic link delivery failed: {0}")]
    Failed(String),

    #[error("Magic link delivery disabled: {0}")]
    Disabled(String),
}

/// The only failure shapes shown to an external caller.
///
/// Every token-presentation failure maps to [`PublicError::InvalidCredential`]
/// so the response does not reveal whether a token existed, expired, or was
/// already used.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PublicError {
    #[error("Invalid or expired credential")]
    InvalidCredential,

    #[error("Too many requests")]
    RateLimited,

    #[error("Invalid request")]
    BadRequest,

    #[error("Service temporarily unavailable")]
    Unavailable,
}

impl Error {
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Failures that indicate a credential was presented out of turn and led,
    /// or may lead, to revocation.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Error::Auth(AuthError::ReuseDetected)
                | Error::Auth(AuthError::FamilyRevoked)
                | Error::Auth(AuthError::ClientMismatch)
        )
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::Session(_))
    }

    pub fn is_crypto_error(&self) -> bool {
        matches!(self, Error::Crypto(_))
    }

    pub fn is_delivery_error(&self) -> bool {
        matches!(self, Error::Delivery(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Transient storage failures are the only errors worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Unavailable(_)))
    }

    pub fn to_public(&self) -> PublicError {
        match self {
            Error::Auth(_) | Error::Session(_) | Error::Crypto(_) => PublicError::InvalidCredential,
            Error::RateLimited(_) => PublicError::RateLimited,
            Error::Validation(_) => PublicError::BadRequest,
            Error::Storage(_) | Error::Event(_) | Error::Delivery(_) => PublicError::Unavailable,
        }
    }
}

impl From<Error> for PublicError {
    fn from(error: Error) -> Self {
        error.to_public()
    }
}
