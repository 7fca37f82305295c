//! Builder pattern for constructing Keyra instances
//!
//! This module provides a type-safe builder for creating [`Keyra`] instances with
//! compile-time validation of storage configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use keyra::KeyraBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build with SQLite and auto-migration
//!     let keyra = KeyraBuilder::new()
//!         .with_sqlite("sqlite::memory:")
//!         .await?
//!         .apply_migrations(true)
//!         .build()
//!         .await?;
//!
//!     // Or build without auto-migration and run manually
//!     let keyra = KeyraBuilder::new()
//!         .with_sqlite("sqlite::memory:")
//!         .await?
//!         .build()
//!         .await?;
//!     keyra.migrate().await?;
//!
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use keyra_core::{
    KeyraConfig,
    config::SessionConfig,
    events::{EventBus, EventHandler, TracingAuditHandler},
    repositories::RepositoryProvider,
    services::{
        DevLogSink, FixedWindowRateLimiter, MagicLinkSender, NoRateLimit, RateLimiter,
        ensure_sender_allowed,
    },
};

use crate::Keyra;

#[cfg(feature = "mailer")]
use crate::MailerConfig;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when building a Keyra instance.
#[derive(Debug, thiserror::Error)]
pub enum KeyraBuilderError {
    /// Failed to connect to storage backend
    #[error("Storage connection failed: {0}")]
    StorageConnection(String),

    /// Failed to run database migrations
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No usable magic link delivery for the configured environment
    #[error("Magic link delivery unavailable: {0}")]
    Delivery(String),

    /// Failed to configure mailer
    #[cfg(feature = "mailer")]
    #[error("Mailer configuration failed: {0}")]
    MailerConfiguration(String),
}

// ============================================================================
// Type-State Markers
// ============================================================================

/// Marker type indicating no storage has been configured yet.
///
/// This is the initial state of [`KeyraBuilder`].
pub struct NoStorage;

/// Marker type indicating storage has been configured.
pub struct WithStorage<R: RepositoryProvider> {
    repositories: Arc<R>,
}

// ============================================================================
// Builder Implementation
// ============================================================================

/// A type-safe builder for constructing [`Keyra`] instances.
///
/// Storage must be configured before [`build`](KeyraBuilder::build) becomes
/// available.
///
/// # Delivery
///
/// Magic links go to the sender given with
/// [`with_sender`](KeyraBuilder::with_sender), or else to the mailer when one
/// is configured. Without either, links are written to the log, which is
/// refused in [`Environment::Production`](crate::Environment::Production).
pub struct KeyraBuilder<Storage> {
    storage: Storage,
    config: KeyraConfig,
    apply_migrations: bool,
    sender: Option<Arc<dyn MagicLinkSender>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    #[cfg(feature = "mailer")]
    mailer_config: Option<MailerConfig>,
}

impl Default for KeyraBuilder<NoStorage> {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyraBuilder<NoStorage> {
    /// Create a new builder with default configuration.
    ///
    /// # Defaults
    ///
    /// - Environment: development
    /// - Magic link lifetime: 15 minutes
    /// - Session lifetime and refresh token lifetime: 30 days
    /// - Reuse grace period: none
    /// - Rate limit: 5 issuances per email and per IP every 10 minutes
    /// - Apply migrations: false
    pub fn new() -> Self {
        Self {
            storage: NoStorage,
            config: KeyraConfig::default(),
            apply_migrations: false,
            sender: None,
            rate_limiter: None,
            event_handlers: Vec::new(),
            #[cfg(feature = "mailer")]
            mailer_config: None,
        }
    }

    /// Configure storage with any repository provider.
    pub fn with_repositories<R: RepositoryProvider>(
        self,
        repositories: Arc<R>,
    ) -> KeyraBuilder<WithStorage<R>> {
        KeyraBuilder {
            storage: WithStorage { repositories },
            config: self.config,
            apply_migrations: self.apply_migrations,
            sender: self.sender,
            rate_limiter: self.rate_limiter,
            event_handlers: self.event_handlers,
            #[cfg(feature = "mailer")]
            mailer_config: self.mailer_config,
        }
    }
}

// ============================================================================
// Storage Configuration Methods (NoStorage -> WithStorage)
// ============================================================================

#[cfg(feature = "sqlite")]
impl KeyraBuilder<NoStorage> {
    /// Configure SQLite storage by connecting to the given URL.
    ///
    /// The database file is created if missing. Every lifecycle event is also
    /// written to the `audit_logs` table.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL (e.g., "sqlite::memory:" or "sqlite://path/to/db.sqlite")
    pub async fn with_sqlite(
        self,
        url: &str,
    ) -> Result<KeyraBuilder<WithStorage<crate::SqliteRepositoryProvider>>, KeyraBuilderError> {
        let provider = crate::SqliteRepositoryProvider::connect(url)
            .await
            .map_err(|e| KeyraBuilderError::StorageConnection(e.to_string()))?;

        Ok(self.with_sqlite_provider(provider))
    }

    /// Configure SQLite storage with an existing connection pool.
    ///
    /// The pool should enable foreign keys; [`with_sqlite`](Self::with_sqlite)
    /// does so for the pools it opens.
    pub fn with_sqlite_pool(
        self,
        pool: sqlx::SqlitePool,
    ) -> KeyraBuilder<WithStorage<crate::SqliteRepositoryProvider>> {
        self.with_sqlite_provider(crate::SqliteRepositoryProvider::new(pool))
    }

    fn with_sqlite_provider(
        mut self,
        provider: crate::SqliteRepositoryProvider,
    ) -> KeyraBuilder<WithStorage<crate::SqliteRepositoryProvider>> {
        self.event_handlers.push(Arc::new(crate::SqliteAuditLog::new(
            provider.pool().clone(),
        )));
        self.with_repositories(Arc::new(provider))
    }
}

// ============================================================================
// Configuration Methods
// ============================================================================

impl<Storage> KeyraBuilder<Storage> {
    /// Replace the whole configuration, typically with
    /// [`KeyraConfig::from_env`].
    pub fn with_config(mut self, config: KeyraConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Deliver magic links through `sender` instead of the mailer or the log.
    pub fn with_sender(mut self, sender: Arc<dyn MagicLinkSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Replace the in-process fixed-window limiter, e.g. with one backed by
    /// shared storage when several instances serve the same users.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Subscribe an additional handler to lifecycle and security events.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Set whether to automatically apply database migrations during build.
    ///
    /// Default: false
    pub fn apply_migrations(mut self, apply: bool) -> Self {
        self.apply_migrations = apply;
        self
    }

    /// Send magic links by email with the given mailer configuration.
    #[cfg(feature = "mailer")]
    pub fn with_mailer(mut self, config: MailerConfig) -> Self {
        self.mailer_config = Some(config);
        self
    }

    /// Configure the mailer from `MAILER_*` environment variables.
    ///
    /// Leaves delivery unchanged when no transport is configured.
    #[cfg(feature = "mailer")]
    pub fn with_mailer_from_env(mut self) -> Result<Self, KeyraBuilderError> {
        let config = MailerConfig::from_env()
            .map_err(|e| KeyraBuilderError::MailerConfiguration(e.to_string()))?;
        if config.is_some() {
            self.mailer_config = config;
        }
        Ok(self)
    }

    fn resolve_sender(&mut self) -> Result<Arc<dyn MagicLinkSender>, KeyraBuilderError> {
        if let Some(sender) = self.sender.take() {
            return Ok(sender);
        }

        if let Some(sender) = self.mailer_sender()? {
            return Ok(sender);
        }

        let sink = DevLogSink::new(
            self.config.environment,
            self.config.magic_link.link_base_url.clone(),
        )
        .map_err(|e| KeyraBuilderError::Delivery(e.to_string()))?;
        tracing::warn!("No magic link delivery configured, links will be written to the log");
        Ok(Arc::new(sink))
    }

    #[cfg(feature = "mailer")]
    fn mailer_sender(&mut self) -> Result<Option<Arc<dyn MagicLinkSender>>, KeyraBuilderError> {
        let Some(config) = self.mailer_config.take() else {
            return Ok(None);
        };
        let sender = keyra_core::services::MailerSender::new(
            config,
            self.config.magic_link.link_base_url.clone(),
        )
        .map_err(|e| KeyraBuilderError::MailerConfiguration(e.to_string()))?;
        Ok(Some(Arc::new(sender)))
    }

    #[cfg(not(feature = "mailer"))]
    fn mailer_sender(&mut self) -> Result<Option<Arc<dyn MagicLinkSender>>, KeyraBuilderError> {
        Ok(None)
    }

    fn resolve_rate_limiter(&mut self) -> Arc<dyn RateLimiter> {
        match self.rate_limiter.take() {
            Some(limiter) => limiter,
            None if self.config.rate_limit.enabled => {
                Arc::new(FixedWindowRateLimiter::from_config(&self.config.rate_limit))
            }
            None => Arc::new(NoRateLimit),
        }
    }
}

impl<R: RepositoryProvider> KeyraBuilder<WithStorage<R>> {
    /// Build the Keyra instance.
    ///
    /// Validates the configuration, resolves delivery and applies migrations
    /// if requested.
    pub async fn build(mut self) -> Result<Keyra<R>, KeyraBuilderError> {
        self.config
            .validate()
            .map_err(|e| KeyraBuilderError::InvalidConfiguration(e.to_string()))?;

        let sender = self.resolve_sender()?;
        ensure_sender_allowed(sender.as_ref(), self.config.environment)
            .map_err(|e| KeyraBuilderError::Delivery(e.to_string()))?;
        let rate_limiter = self.resolve_rate_limiter();

        if self.apply_migrations {
            self.storage
                .repositories
                .migrate()
                .await
                .map_err(|e| KeyraBuilderError::Migration(e.to_string()))?;
        }

        let events = EventBus::new();
        events.register(Arc::new(TracingAuditHandler)).await;
        for handler in self.event_handlers {
            events.register(handler).await;
        }

        tracing::info!(
            environment = %self.config.environment,
            reuse_grace_period_secs = self.config.session.reuse_grace_period.num_seconds(),
            bind_client = self.config.session.bind_client,
            "Keyra initialized"
        );

        Keyra::new(
            self.storage.repositories,
            self.config,
            sender,
            rate_limiter,
            events,
        )
        .map_err(|e| KeyraBuilderError::Delivery(e.to_string()))
    }
}
