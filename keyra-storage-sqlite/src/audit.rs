use async_trait::async_trait;
use keyra_core::{
    error::EventError,
    events::{Event, EventHandler},
};
use sqlx::SqlitePool;

/// Persists every event to the `audit_logs` table as JSON.
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for SqliteAuditLog {
    async fn handle_event(&self, event: &Event) -> Result<(), EventError> {
        let details = serde_json::to_string(event)
            .map_err(|e| EventError::HandlerError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO audit_logs (event, user_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event.name())
        .bind(event.user_id().map(|id| id.as_str()))
        .bind(details)
        .bind(event.timestamp().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, event = event.name(), "Failed to write audit log");
            EventError::HandlerError(e.to_string())
        })?;

        Ok(())
    }
}
