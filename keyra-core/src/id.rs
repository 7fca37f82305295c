//! Prefixed identifiers for users, sessions and refresh-token families
//!
//! Identifiers look like `{prefix}_{random}` where the random part is 96 bits
//! from the OS RNG, encoded as URL-safe base64. They are opaque and carry no
//! meaning beyond equality.

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use rand::{TryRngCore, rngs::OsRng};

const ID_BYTES: usize = 12;

/// Generate `{prefix}_{random}` with 96 bits of entropy.
///
/// # Panics
///
/// Panics if the OS random number generator fails.
pub fn generate_prefixed_id(prefix: &str) -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .expect("OS RNG failure - system entropy source unavailable");
    format!("{prefix}_{}", BASE64_URL_SAFE_NO_PAD.encode(bytes))
}

pub fn validate_prefixed_id(id: &str, expected_prefix: &str) -> bool {
    let Some(random_part) = id
        .strip_prefix(expected_prefix)
        .and_then(|rest| rest.strip_prefix('_'))
    else {
        return false;
    };

    match BASE64_URL_SAFE_NO_PAD.decode(random_part) {
        Ok(decoded) => decoded.len() >= ID_BYTES,
        Err(_) => false,
    }
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new(id: &str) -> Self {
                Self(id.to_string())
            }

            pub fn new_random() -> Self {
                Self($crate::id::generate_prefixed_id($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            pub fn is_valid(&self) -> bool {
                $crate::id::validate_prefixed_id(&self.0, $prefix)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

pub(crate) use prefixed_id;

#[cfg(test)]
mod tests {
    use super::*;

    prefixed_id!(TestId, "tst");

    #[test]
    fn test_generate_prefixed_id() {
        let id = generate_prefixed_id("usr");
        assert!(id.starts_with("usr_"));
        assert_ne!(id, generate_prefixed_id("usr"));
    }

    #[test]
    fn test_validate_prefixed_id() {
        let id = generate_prefixed_id("ses");
        assert!(validate_prefixed_id(&id, "ses"));
        assert!(!validate_prefixed_id(&id, "fam"));

        assert!(!validate_prefixed_id("ses", "ses"));
        assert!(!validate_prefixed_id("ses_", "ses"));
        assert!(!validate_prefixed_id("ses_invalid!", "ses"));
        assert!(!validate_prefixed_id("sesx_AAAAAAAAAAAAAAAA", "ses"));
    }

    #[test]
    fn test_macro_generated_id() {
        let id = TestId::new_random();
        assert!(id.as_str().starts_with("tst_"));
        assert!(id.is_valid());
        assert!(!TestId::new("tst_short").is_valid());
        assert_eq!(TestId::from("abc").to_string(), "abc");
    }
}
