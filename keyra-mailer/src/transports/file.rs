use async_trait::async_trait;
use lettre::Transport;
use std::path::{Path, PathBuf};

use crate::{Email, Mailer, MailerError};

/// Drops each message as an `.eml` file into a directory, for local
/// development and tests.
#[derive(Debug, Clone)]
pub struct FileTransport {
    outbox: lettre::FileTransport,
    dir: PathBuf,
}

impl FileTransport {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, MailerError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            outbox: lettre::FileTransport::new(&dir),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Mailer for FileTransport {
    async fn send_email(&self, email: Email) -> Result<(), MailerError> {
        let message = email.to_message()?;

        let outbox = self.outbox.clone();
        let id = tokio::task::spawn_blocking(move || outbox.send(&message))
            .await
            .map_err(|e| MailerError::Io(std::io::Error::other(e)))??;

        tracing::debug!(dir = %self.dir.display(), %id, "Email written to outbox");
        Ok(())
    }
}
