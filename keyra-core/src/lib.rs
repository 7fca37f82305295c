//! Core of the keyra passwordless credential engine
//!
//! This crate contains the credential state machines and the storage
//! contracts they run against. It does not talk to a database itself; see
//! `keyra-storage-sqlite` for a persistent backend, or
//! [`InMemoryRepositoryProvider`](repositories::InMemoryRepositoryProvider)
//! for tests.
//!
//! The pieces, in the order a login flows through them:
//!
//! - [`TokenCodec`] generates opaque tokens and the hashes they are stored as.
//! - [`MagicLinkIssuer`] persists a short-lived link and hands it to a
//!   [`MagicLinkSender`](services::MagicLinkSender).
//! - [`MagicLinkVerifier`] consumes a link exactly once.
//! - [`SessionManager`] turns a verified address into a [`Session`] with a
//!   fresh refresh-token family.
//! - [`RefreshRotationEngine`] exchanges refresh tokens and revokes the
//!   family when a retired token comes back.
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod id;
pub mod repositories;
pub mod services;
pub mod session;
pub mod storage;
pub mod user;
pub mod validation;

pub use config::{Environment, KeyraConfig};
pub use crypto::{RawToken, TokenCodec, TokenHash};
pub use error::{AuthError, Error, PublicError};
pub use events::{Event, EventBus, EventHandler};
pub use services::{MagicLinkIssuer, MagicLinkVerifier, RefreshRotationEngine, SessionManager};
pub use session::{RequestMetadata, Session, SessionId};
pub use storage::FamilyId;
pub use user::{User, UserId};
