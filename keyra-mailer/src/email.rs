use lettre::Message;
use lettre::message::{Mailbox, MultiPart};
use serde::{Deserialize, Serialize};

use crate::MailerError;

/// A rendered message for a single recipient.
///
/// Every message carries both a plain-text and an HTML rendering and is sent
/// as `multipart/alternative`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

impl Email {
    pub fn validate(&self) -> Result<(), MailerError> {
        let required = [
            ("recipient", &self.to),
            ("sender", &self.from),
            ("subject", &self.subject),
            ("text body", &self.text_body),
        ];
        match required.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(MailerError::Incomplete(field)),
            None => Ok(()),
        }
    }

    /// Assemble the wire message, checking both mailboxes.
    pub fn to_message(&self) -> Result<Message, MailerError> {
        self.validate()?;

        let message = Message::builder()
            .from(mailbox(&self.from)?)
            .to(mailbox(&self.to)?)
            .subject(self.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(
                self.text_body.clone(),
                self.html_body.clone(),
            ))?;

        Ok(message)
    }
}

fn mailbox(address: &str) -> Result<Mailbox, MailerError> {
    address.parse().map_err(|source| MailerError::Mailbox {
        address: address.to_string(),
        source,
    })
}
