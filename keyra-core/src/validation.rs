use crate::error::ValidationError;
use regex::Regex;
use std::sync::LazyLock;

/// Practical subset of RFC 5322, applied after normalization.
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("Invalid email regex pattern")
});

const MAX_EMAIL_LENGTH: usize = 254;

/// Canonical form of an email address: surrounding whitespace removed and
/// lowercased. Rate limiting, token records and user lookup all key on this.
///
/// ```rust
/// use keyra_core::validation::normalize_email;
///
/// assert_eq!(normalize_email("  Alice@Example.COM ").unwrap(), "alice@example.com");
/// assert!(normalize_email("not-an-email").is_err());
/// ```
pub fn normalize_email(email: &str) -> Result<String, ValidationError> {
    let normalized = email.trim().to_lowercase();
    validate_email(&normalized)?;
    Ok(normalized)
}

pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() {
        return Err(ValidationError::MissingField(
            "Email is required".to_string(),
        ));
    }

    if email.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::InvalidEmail(
            "Email is too long".to_string(),
        ));
    }

    if EMAIL_REGEX.is_match(email) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEmail(email.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email("User@Example.com").unwrap(),
            "user@example.com"
        );
        assert_eq!(
            normalize_email("\tuser.name+tag@sub.example.org\n").unwrap(),
            "user.name+tag@sub.example.org"
        );
    }

    #[test]
    fn test_normalize_rejects_invalid() {
        assert!(matches!(
            normalize_email("   "),
            Err(ValidationError::MissingField(_))
        ));
        assert!(matches!(
            normalize_email("invalid-email"),
            Err(ValidationError::InvalidEmail(_))
        ));
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("user@").is_err());
        assert!(normalize_email("user@example").is_err());
        assert!(normalize_email("user name@example.com").is_err());
    }

    #[test]
    fn test_validate_email_length() {
        let long = format!("{}@example.com", "a".repeat(250));
        assert!(matches!(
            validate_email(&long),
            Err(ValidationError::InvalidEmail(_))
        ));
    }
}
