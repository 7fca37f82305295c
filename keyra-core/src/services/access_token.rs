//! Short-lived signed access tokens
//!
//! Access tokens are stateless HS256 JWTs minted alongside every refresh
//! token. They are never stored and cannot be revoked before they expire;
//! keeping their lifetime short bounds that window.
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::AccessTokenConfig;
use crate::error::CryptoError;
use crate::{Error, Session, SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id
    pub sub: String,
    /// Session id
    pub sid: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn user_id(&self) -> UserId {
        UserId::new(&self.sub)
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(&self.sid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct AccessTokenIssuer {
    config: AccessTokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AccessTokenIssuer {
    pub fn new(config: AccessTokenConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Mint a token for `session`, never outliving the session itself.
    pub fn issue(&self, session: &Session) -> Result<AccessToken, Error> {
        let now = Utc::now();
        let expires_at = (now + self.config.ttl).min(session.expires_at);

        let claims = AccessClaims {
            sub: session.user_id.to_string(),
            sid: session.id.to_string(),
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CryptoError::AccessTokenSigning(e.to_string()))?;

        Ok(AccessToken { token, expires_at })
    }

    /// Check signature, issuer and expiry. Says nothing about whether the
    /// session is still active; callers that need that must ask the store.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| CryptoError::AccessTokenVerification(e.to_string()))?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FamilyId;
    use chrono::Duration;

    fn session(expires_in: Duration) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::new_random(),
            user_id: UserId::new_random(),
            family_id: FamilyId::new_random(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_seen_at: now,
            expires_at: now + expires_in,
            revoked_at: None,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = AccessTokenIssuer::new(AccessTokenConfig::default());
        let session = session(Duration::days(30));

        let token = issuer.issue(&session).unwrap();
        let claims = issuer.verify(&token.token).unwrap();

        assert_eq!(claims.user_id(), session.user_id);
        assert_eq!(claims.session_id(), session.id);
        assert_eq!(claims.iss, "keyra");
        assert!(token.expires_at <= Utc::now() + Duration::minutes(15));
    }

    #[test]
    fn test_token_never_outlives_session() {
        let issuer = AccessTokenIssuer::new(AccessTokenConfig::default());
        let session = session(Duration::minutes(2));

        let token = issuer.issue(&session).unwrap();
        assert_eq!(token.expires_at, session.expires_at);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = AccessTokenIssuer::new(AccessTokenConfig::default());
        let other = AccessTokenIssuer::new(AccessTokenConfig {
            secret: "another-secret-entirely".to_string(),
            ..AccessTokenConfig::default()
        });

        let token = issuer.issue(&session(Duration::days(1))).unwrap();
        assert!(matches!(
            other.verify(&token.token),
            Err(Error::Crypto(CryptoError::AccessTokenVerification(_)))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = AccessTokenConfig::default();
        let issuer = AccessTokenIssuer::new(config.clone());
        let past = Utc::now() - Duration::minutes(10);
        let claims = AccessClaims {
            sub: "usr_x".to_string(),
            sid: "ses_x".to_string(),
            iss: config.issuer.clone(),
            iat: (past - Duration::minutes(15)).timestamp(),
            exp: past.timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.secret.as_bytes()),
        )
        .unwrap();

        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let issuer = AccessTokenIssuer::new(AccessTokenConfig::default());
        assert!(issuer.verify("not.a.jwt").is_err());
    }
}
