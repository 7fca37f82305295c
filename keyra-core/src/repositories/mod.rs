//! Repository traits for the data access layer
//!
//! Services never talk to a database directly. They are generic over the
//! `*Repository` traits defined here, and a storage backend exposes its
//! implementations through the `*RepositoryProvider` traits:
//!
//! - Individual `*Repository` traits define the operations for each record type
//! - Individual `*RepositoryProvider` traits give access to each repository
//! - [`RepositoryProvider`] combines them and adds migrations and health checks
//!
//! Operations documented as atomic must be implemented as a single unit of
//! work by the backend (a transaction, or a conditional update). Services
//! rely on that for single-use and rotation guarantees.

pub mod adapter;
pub mod magic_link;
pub mod memory;
pub mod refresh_token;
pub mod session;
pub mod user;

pub use adapter::{
    MagicLinkRepositoryAdapter, RefreshTokenRepositoryAdapter, SessionRepositoryAdapter,
    UserRepositoryAdapter,
};
pub use magic_link::MagicLinkRepository;
pub use memory::InMemoryRepositoryProvider;
pub use refresh_token::RefreshTokenRepository;
pub use session::SessionRepository;
pub use user::UserRepository;

use async_trait::async_trait;

use crate::Error;

pub trait UserRepositoryProvider: Send + Sync + 'static {
    type UserRepo: UserRepository;

    fn user(&self) -> &Self::UserRepo;
}

pub trait SessionRepositoryProvider: Send + Sync + 'static {
    type SessionRepo: SessionRepository;

    fn session(&self) -> &Self::SessionRepo;
}

pub trait MagicLinkRepositoryProvider: Send + Sync + 'static {
    type MagicLinkRepo: MagicLinkRepository;

    fn magic_link(&self) -> &Self::MagicLinkRepo;
}

pub trait RefreshTokenRepositoryProvider: Send + Sync + 'static {
    type RefreshTokenRepo: RefreshTokenRepository;

    fn refresh_token(&self) -> &Self::RefreshTokenRepo;
}

/// Everything a storage backend has to provide.
///
/// ```rust,ignore
/// use keyra_core::repositories::*;
///
/// struct MyStorage { /* ... */ }
///
/// impl UserRepositoryProvider for MyStorage {
///     type UserRepo = MyUserRepository;
///     fn user(&self) -> &Self::UserRepo { &self.users }
/// }
///
/// // ... the other provider traits ...
///
/// #[async_trait]
/// impl RepositoryProvider for MyStorage {
///     async fn migrate(&self) -> Result<(), Error> { /* ... */ }
///     async fn health_check(&self) -> Result<(), Error> { /* ... */ }
/// }
/// ```
#[async_trait]
pub trait RepositoryProvider:
    UserRepositoryProvider
    + SessionRepositoryProvider
    + MagicLinkRepositoryProvider
    + RefreshTokenRepositoryProvider
{
    /// Bring the schema up to date
    async fn migrate(&self) -> Result<(), Error>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> Result<(), Error>;
}
