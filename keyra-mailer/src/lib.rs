//! Email delivery for keyra.
//!
//! Provides a transport-agnostic [`Mailer`] trait with SMTP and file-based
//! transports, plus the [`MagicLinkEmail`] message sent to users who request a
//! sign-in link.

pub mod config;
pub mod email;
pub mod error;
pub mod mailer;
pub mod templates;
pub mod transports;

pub use config::{MailerConfig, TlsMode, TransportConfig};
pub use email::Email;
pub use error::MailerError;
pub use mailer::Mailer;
pub use templates::MagicLinkEmail;
pub use transports::{FileTransport, SmtpSettings, SmtpTransport};

pub mod prelude {
    pub use crate::{Email, MagicLinkEmail, Mailer, MailerConfig, MailerError};
}
