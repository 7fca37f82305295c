//! Token codec: generation, hashing and constant-time comparison of opaque tokens
//!
//! Raw tokens are the only credential material handed out. They carry 256 bits
//! from the OS CSPRNG, are encoded as URL-safe base64 without padding, and are
//! never stored. Storage only ever sees the hex SHA-256 digest.
//!
//! SHA-256 (rather than a slow password hash) is enough here because the input
//! already has full entropy. Lookups go by digest so verification never has to
//! iterate over stored tokens.

use std::fmt;

use rand::{TryRngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 32;

/// A raw credential as handed to the user.
///
/// `Debug` is redacted so the value cannot end up in logs by accident. Use
/// [`RawToken::expose`] at the single point where the token leaves the process.
#[derive(Clone, PartialEq, Eq)]
pub struct RawToken(String);

impl RawToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn hash(&self) -> TokenHash {
        TokenCodec::hash(&self.0)
    }
}

impl fmt::Debug for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawToken([REDACTED])")
    }
}

/// Hex-encoded SHA-256 digest of a raw token. Safe to persist and log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenHash(String);

impl TokenHash {
    /// Wrap a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters of the digest, enough to correlate log lines.
    pub fn fingerprint(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct TokenCodec;

impl TokenCodec {
    /// Generate a fresh raw token together with its digest.
    ///
    /// # Panics
    ///
    /// Panics if the OS random number generator fails. Issuing a credential
    /// without a working entropy source is not recoverable.
    pub fn generate() -> (RawToken, TokenHash) {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .expect("OS RNG failure - system entropy source unavailable");
        let raw = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);
        let hash = Self::hash(&raw);
        (RawToken(raw), hash)
    }

    pub fn hash(raw: &str) -> TokenHash {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        TokenHash(hex::encode(hasher.finalize()))
    }

    /// Check a presented raw token against a stored digest in constant time.
    pub fn verify(raw: &str, stored: &TokenHash) -> bool {
        let computed = Self::hash(raw);
        constant_time_compare(computed.as_str().as_bytes(), stored.as_str().as_bytes())
    }
}

pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
