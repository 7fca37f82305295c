use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{FileTransport, Mailer, MailerError, SmtpSettings, SmtpTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailerConfig {
    pub transport: TransportConfig,
    /// Bare address the mail is sent from
    pub from_address: String,
    /// Display name shown next to `from_address`
    pub from_name: Option<String>,
    /// Product name used in subjects and bodies
    pub app_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Smtp(SmtpSettings),
    File { output_dir: PathBuf },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext; only for a relay on a trusted local network.
    None,
    #[default]
    StartTls,
    Tls,
}

impl FromStr for TlsMode {
    type Err = MailerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TlsMode::None),
            "starttls" | "start_tls" => Ok(TlsMode::StartTls),
            "tls" => Ok(TlsMode::Tls),
            other => Err(MailerError::Config(format!("unknown TLS mode: {other}"))),
        }
    }
}

impl MailerConfig {
    /// Read the mailer configuration from `MAILER_*` environment variables.
    ///
    /// Returns `None` when neither `MAILER_SMTP_HOST` nor `MAILER_FILE_OUTPUT_DIR`
    /// is set, i.e. no delivery provider is configured.
    pub fn from_env() -> Result<Option<Self>, MailerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, MailerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport = match (lookup("MAILER_SMTP_HOST"), lookup("MAILER_FILE_OUTPUT_DIR")) {
            (Some(host), _) => {
                let port = lookup("MAILER_SMTP_PORT")
                    .map(|port| {
                        port.trim().parse::<u16>().map_err(|_| {
                            MailerError::Config(format!("invalid MAILER_SMTP_PORT: {port}"))
                        })
                    })
                    .transpose()?;
                let tls = lookup("MAILER_SMTP_TLS")
                    .map(|tls| tls.parse())
                    .transpose()?
                    .unwrap_or_default();

                TransportConfig::Smtp(SmtpSettings {
                    host,
                    port,
                    username: lookup("MAILER_SMTP_USERNAME"),
                    password: lookup("MAILER_SMTP_PASSWORD"),
                    tls,
                })
            }
            (None, Some(dir)) => TransportConfig::File {
                output_dir: PathBuf::from(dir),
            },
            (None, None) => return Ok(None),
        };

        let defaults = Self::default();
        Ok(Some(Self {
            transport,
            from_address: lookup("MAILER_FROM_ADDRESS").unwrap_or(defaults.from_address),
            from_name: lookup("MAILER_FROM_NAME"),
            app_name: lookup("MAILER_APP_NAME").unwrap_or(defaults.app_name),
        }))
    }

    pub fn build_transport(&self) -> Result<Box<dyn Mailer>, MailerError> {
        match &self.transport {
            TransportConfig::Smtp(settings) => Ok(Box::new(SmtpTransport::connect(settings)?)),
            TransportConfig::File { output_dir } => Ok(Box::new(FileTransport::new(output_dir)?)),
        }
    }

    /// The `From` header value, with the display name when one is set.
    pub fn sender(&self) -> String {
        match &self.from_name {
            Some(name) => format!("{name} <{}>", self.from_address),
            None => self.from_address.clone(),
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::File {
                output_dir: PathBuf::from("./emails"),
            },
            from_address: "noreply@example.com".to_string(),
            from_name: None,
            app_name: "Keyra".to_string(),
        }
    }
}
