//! Service layer
//!
//! Services hold no mutable state of their own between calls. Everything
//! that must survive a request lives behind the repository traits, so any
//! number of service instances can share one store.

pub mod access_token;
pub mod delivery;
pub mod magic_link;
pub mod rate_limit;
pub mod retry;
pub mod rotation;
pub mod session;

pub use access_token::{AccessClaims, AccessToken, AccessTokenIssuer};
pub use delivery::{DevLogSink, MagicLinkSender, ensure_sender_allowed, magic_link_url};
pub use magic_link::{IssuedMagicLink, MagicLinkIssuer, MagicLinkVerifier, VerifiedMagicLink};
pub use rate_limit::{FixedWindowRateLimiter, NoRateLimit, RateLimiter};
pub use retry::RetryPolicy;
pub use rotation::{RefreshRotationEngine, Rotation};
pub use session::{NewSession, SessionManager};

#[cfg(feature = "mailer")]
pub use delivery::MailerSender;
