//! Engine configuration
//!
//! Every setting has a default suitable for local development. Production
//! deployments are expected to come from [`KeyraConfig::from_env`], which
//! refuses to run in production with the built-in access-token secret.
use std::fmt;
use std::str::FromStr;

use chrono::Duration;

use crate::error::{Error, ValidationError};
use crate::services::retry::RetryPolicy;

/// Secret used for access tokens when none is configured. Only accepted in
/// development.
pub const DEVELOPMENT_ACCESS_TOKEN_SECRET: &str = "keyra-development-secret-change-me";

const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

impl FromStr for Environment {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(ValidationError::InvalidConfig(format!(
                "unknown environment: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MagicLinkConfig {
    /// How long an issued link stays valid
    pub ttl: Duration,
    /// The raw token is appended to this URL as the `token` query parameter
    pub link_base_url: String,
}

impl Default for MagicLinkConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(15),
            link_base_url: "http://localhost:8000/auth/magic-link".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Absolute cap on a session, counted from login. Rotation never extends it.
    pub lifetime: Duration,
    pub refresh_token_ttl: Duration,
    /// How long after a rotation the superseded token may be presented again
    /// without revoking the family. Zero means every reuse revokes.
    pub reuse_grace_period: Duration,
    /// Revoke the family when a refresh comes from a different client than
    /// the one that created the session.
    pub bind_client: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::days(30),
            refresh_token_ttl: Duration::days(30),
            reuse_grace_period: Duration::zero(),
            bind_client: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Issuance requests allowed per key within one window
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 5,
            window: Duration::seconds(600),
        }
    }
}

#[derive(Clone)]
pub struct AccessTokenConfig {
    pub secret: String,
    pub ttl: Duration,
    pub issuer: String,
}

impl fmt::Debug for AccessTokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenConfig")
            .field("secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl Default for AccessTokenConfig {
    fn default() -> Self {
        Self {
            secret: DEVELOPMENT_ACCESS_TOKEN_SECRET.to_string(),
            ttl: Duration::minutes(15),
            issuer: "keyra".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeyraConfig {
    pub environment: Environment,
    pub magic_link: MagicLinkConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub access_token: AccessTokenConfig,
    pub retry: RetryPolicy,
}

impl KeyraConfig {
    /// Read the configuration from `KEYRA_*` environment variables.
    ///
    /// Unset variables keep their defaults. Durations are given in seconds,
    /// except `KEYRA_RETRY_BASE_DELAY_MS`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(env) = lookup("KEYRA_ENV") {
            config.environment = env.parse()?;
        }

        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_MAGIC_LINK_TTL_SECS")? {
            config.magic_link.ttl = Duration::seconds(secs);
        }
        if let Some(url) = lookup("KEYRA_MAGIC_LINK_BASE_URL") {
            config.magic_link.link_base_url = url;
        }

        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_SESSION_LIFETIME_SECS")? {
            config.session.lifetime = Duration::seconds(secs);
        }
        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_REFRESH_TOKEN_TTL_SECS")? {
            config.session.refresh_token_ttl = Duration::seconds(secs);
        }
        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_REUSE_GRACE_SECS")? {
            config.session.reuse_grace_period = Duration::seconds(secs);
        }
        if let Some(bind) = parse_var::<bool>(&lookup, "KEYRA_BIND_CLIENT")? {
            config.session.bind_client = bind;
        }

        if let Some(enabled) = parse_var::<bool>(&lookup, "KEYRA_RATE_LIMIT_ENABLED")? {
            config.rate_limit.enabled = enabled;
        }
        if let Some(max) = parse_var::<u32>(&lookup, "KEYRA_RATE_LIMIT_MAX")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_RATE_LIMIT_WINDOW_SECS")? {
            config.rate_limit.window = Duration::seconds(secs);
        }

        if let Some(secret) = lookup("KEYRA_ACCESS_TOKEN_SECRET") {
            config.access_token.secret = secret;
        }
        if let Some(secs) = parse_var::<i64>(&lookup, "KEYRA_ACCESS_TOKEN_TTL_SECS")? {
            config.access_token.ttl = Duration::seconds(secs);
        }
        if let Some(issuer) = lookup("KEYRA_ACCESS_TOKEN_ISSUER") {
            config.access_token.issuer = issuer;
        }

        if let Some(max) = parse_var::<u32>(&lookup, "KEYRA_RETRY_MAX")? {
            config.retry.max_retries = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "KEYRA_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = std::time::Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let positive = [
            ("magic link ttl", self.magic_link.ttl),
            ("session lifetime", self.session.lifetime),
            ("refresh token ttl", self.session.refresh_token_ttl),
            ("rate limit window", self.rate_limit.window),
            ("access token ttl", self.access_token.ttl),
        ];
        for (name, value) in positive {
            if value <= Duration::zero() {
                return Err(invalid(format!("{name} must be positive")));
            }
        }

        if self.session.reuse_grace_period < Duration::zero() {
            return Err(invalid("reuse grace period must not be negative"));
        }

        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            return Err(invalid("rate limit maximum must be at least 1"));
        }

        if self.magic_link.link_base_url.trim().is_empty() {
            return Err(invalid("magic link base url is required"));
        }

        if self.access_token.secret.is_empty() {
            return Err(invalid("access token secret is required"));
        }

        if self.environment.is_production() {
            if self.access_token.secret == DEVELOPMENT_ACCESS_TOKEN_SECRET {
                return Err(invalid(
                    "the development access token secret cannot be used in production",
                ));
            }
            if self.access_token.secret.len() < MIN_PRODUCTION_SECRET_LEN {
                return Err(invalid(format!(
                    "access token secret must be at least {MIN_PRODUCTION_SECRET_LEN} bytes in production"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Validation(ValidationError::InvalidConfig(message.into()))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, Error> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("invalid {key}: {raw}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = KeyraConfig::default();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.magic_link.ttl, Duration::minutes(15));
        assert_eq!(config.session.lifetime, Duration::days(30));
        assert_eq!(config.session.refresh_token_ttl, Duration::days(30));
        assert_eq!(config.session.reuse_grace_period, Duration::zero());
        assert!(!config.session.bind_client);
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window, Duration::seconds(600));
        assert_eq!(config.access_token.ttl, Duration::minutes(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = KeyraConfig::from_lookup(lookup(&[
            ("KEYRA_MAGIC_LINK_TTL_SECS", "300"),
            ("KEYRA_REUSE_GRACE_SECS", "10"),
            ("KEYRA_BIND_CLIENT", "true"),
            ("KEYRA_RATE_LIMIT_MAX", "3"),
            ("KEYRA_MAGIC_LINK_BASE_URL", "https://app.example.com/login"),
        ]))
        .unwrap();

        assert_eq!(config.magic_link.ttl, Duration::minutes(5));
        assert_eq!(config.session.reuse_grace_period, Duration::seconds(10));
        assert!(config.session.bind_client);
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(
            config.magic_link.link_base_url,
            "https://app.example.com/login"
        );
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = KeyraConfig::from_lookup(lookup(&[("KEYRA_MAGIC_LINK_TTL_SECS", "soon")]));
        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn test_production_requires_real_secret() {
        let result = KeyraConfig::from_lookup(lookup(&[("KEYRA_ENV", "production")]));
        assert!(result.is_err());

        let result = KeyraConfig::from_lookup(lookup(&[
            ("KEYRA_ENV", "prod"),
            ("KEYRA_ACCESS_TOKEN_SECRET", "too-short"),
        ]));
        assert!(result.is_err());

        let config = KeyraConfig::from_lookup(lookup(&[
            ("KEYRA_ENV", "production"),
            (
                "KEYRA_ACCESS_TOKEN_SECRET",
                "0123456789abcdef0123456789abcdef",
            ),
        ]))
        .unwrap();
        assert!(config.environment.is_production());
    }

    #[test]
    fn test_non_positive_ttl_rejected() {
        let mut config = KeyraConfig::default();
        config.magic_link.ttl = Duration::zero();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let config = AccessTokenConfig::default();
        assert!(!format!("{config:?}").contains(DEVELOPMENT_ACCESS_TOKEN_SECRET));
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("staging".parse::<Environment>().is_err());
    }
}
