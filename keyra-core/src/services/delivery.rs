//! Delivery of magic links to their recipients
//!
//! The issuer hands each raw token to exactly one [`MagicLinkSender`]. The
//! sender is the only component allowed to see the raw token besides the
//! caller of the issuer.
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Error;
use crate::config::Environment;
use crate::crypto::RawToken;
use crate::error::DeliveryError;

#[async_trait]
pub trait MagicLinkSender: Send + Sync + 'static {
    async fn send_magic_link(
        &self,
        email: &str,
        token: &RawToken,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Senders that expose raw tokens outside the recipient's inbox must say
    /// so here; they are refused in production.
    fn is_development_only(&self) -> bool {
        false
    }
}

/// Refuse a development-only sender under a production configuration.
pub fn ensure_sender_allowed(
    sender: &dyn MagicLinkSender,
    environment: Environment,
) -> Result<(), Error> {
    if environment.is_production() && sender.is_development_only() {
        tracing::error!("Refusing a development-only magic link sender in production");
        return Err(Error::Delivery(DeliveryError::Disabled(
            "development-only magic link delivery cannot be used in production".to_string(),
        )));
    }
    Ok(())
}

/// Append the raw token to `base_url` as the `token` query parameter.
///
/// Tokens are URL-safe base64, so no escaping is needed.
pub fn magic_link_url(base_url: &str, token: &RawToken) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!("{base_url}{separator}token={}", token.expose())
}

/// Writes magic links to the log instead of sending them.
///
/// For local development only. It cannot be constructed for
/// [`Environment::Production`], and [`ensure_sender_allowed`] rejects one
/// built elsewhere and handed to a production instance.
#[derive(Debug, Clone)]
pub struct DevLogSink {
    link_base_url: String,
}

impl DevLogSink {
    pub fn new(environment: Environment, link_base_url: impl Into<String>) -> Result<Self, Error> {
        if environment.is_production() {
            return Err(Error::Delivery(DeliveryError::Disabled(
                "the development log sink cannot deliver magic links in production".to_string(),
            )));
        }

        Ok(Self {
            link_base_url: link_base_url.into(),
        })
    }
}

#[async_trait]
impl MagicLinkSender for DevLogSink {
    async fn send_magic_link(
        &self,
        email: &str,
        token: &RawToken,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let link = magic_link_url(&self.link_base_url, token);
        tracing::warn!(
            target: "keyra::dev_delivery",
            email,
            %expires_at,
            %link,
            "Development delivery: magic link not sent, logged instead"
        );
        Ok(())
    }

    fn is_development_only(&self) -> bool {
        true
    }
}

#[cfg(feature = "mailer")]
pub use self::mailer_impl::MailerSender;

#[cfg(feature = "mailer")]
mod mailer_impl {
    use super::*;
    use keyra_mailer::prelude::*;

    /// Sends magic links by email through a `keyra-mailer` transport.
    pub struct MailerSender {
        transport: Box<dyn Mailer>,
        config: MailerConfig,
        link_base_url: String,
    }

    impl MailerSender {
        pub fn new(config: MailerConfig, link_base_url: impl Into<String>) -> Result<Self, Error> {
            let transport = config
                .build_transport()
                .map_err(|e| Error::Delivery(DeliveryError::Failed(e.to_string())))?;

            Ok(Self::with_transport(config, transport, link_base_url))
        }

        pub fn with_transport(
            config: MailerConfig,
            transport: Box<dyn Mailer>,
            link_base_url: impl Into<String>,
        ) -> Self {
            Self {
                transport,
                config,
                link_base_url: link_base_url.into(),
            }
        }

        /// Build from `MAILER_*` variables. `None` when no transport is configured.
        pub fn from_env(link_base_url: impl Into<String>) -> Result<Option<Self>, Error> {
            let config = MailerConfig::from_env()
                .map_err(|e| Error::Delivery(DeliveryError::Failed(e.to_string())))?;

            config.map(|config| Self::new(config, link_base_url)).transpose()
        }
    }

    #[async_trait]
    impl MagicLinkSender for MailerSender {
        async fn send_magic_link(
            &self,
            email: &str,
            token: &RawToken,
            expires_at: DateTime<Utc>,
        ) -> Result<(), Error> {
            let link = magic_link_url(&self.link_base_url, token);
            let expires_in_minutes = (expires_at - Utc::now()).num_minutes().max(1);

            let message = MagicLinkEmail::build(&self.config, email, &link, expires_in_minutes)
                .map_err(|e| Error::Delivery(DeliveryError::Failed(e.to_string())))?;

            self.transport.send_email(message).await.map_err(|e| {
                tracing::error!(error = %e, email, "Failed to send magic link email");
                Error::Delivery(DeliveryError::Failed(e.to_string()))
            })?;

            tracing::info!(email, "Magic link email sent");
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_link_url() {
        let token = RawToken::new("tok");
        assert_eq!(
            magic_link_url("https://example.com/login", &token),
            "https://example.com/login?token=tok"
        );
        assert_eq!(
            magic_link_url("https://example.com/login?next=/home", &token),
            "https://example.com/login?next=/home&token=tok"
        );
    }

    #[test]
    fn test_dev_sink_refuses_production() {
        let result = DevLogSink::new(Environment::Production, "http://localhost");
        assert!(matches!(
            result,
            Err(Error::Delivery(DeliveryError::Disabled(_)))
        ));
    }

    #[test]
    fn test_dev_sink_not_allowed_in_production() {
        let sink = DevLogSink::new(Environment::Development, "http://localhost").unwrap();

        assert!(ensure_sender_allowed(&sink, Environment::Development).is_ok());
        assert!(matches!(
            ensure_sender_allowed(&sink, Environment::Production),
            Err(Error::Delivery(DeliveryError::Disabled(_)))
        ));
    }

    #[tokio::test]
    async fn test_dev_sink_delivers_in_development() {
        let sink = DevLogSink::new(Environment::Development, "http://localhost/login").unwrap();
        let result = sink
            .send_magic_link("user@example.com", &RawToken::new("tok"), Utc::now())
            .await;
        assert!(result.is_ok());
    }
}
