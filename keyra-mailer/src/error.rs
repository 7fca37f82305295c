use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailerError {
    #[error("Invalid mailbox {address}: {source}")]
    Mailbox {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("Incomplete email: {0}")]
    Incomplete(&'static str),

    #[error("Failed to assemble message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("Failed to render template: {0}")]
    Template(#[from] askama::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("Failed to write email file: {0}")]
    File(#[from] lettre::transport::file::Error),

    #[error("Invalid mailer configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
