use crate::{Error, User, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Repository for user data access
#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, Error>;

    /// Find a user by normalized email
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, Error>;

    /// Return the user for `email`, creating it if needed, with the email
    /// marked verified as of `now` unless it already was.
    async fn find_or_create_verified(&self, email: &str, now: DateTime<Utc>)
    -> Result<User, Error>;
}
