use async_trait::async_trait;

use crate::{Email, MailerError};

/// Delivers rendered messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, email: Email) -> Result<(), MailerError>;
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for Box<M> {
    async fn send_email(&self, email: Email) -> Result<(), MailerError> {
        M::send_email(self, email).await
    }
}
