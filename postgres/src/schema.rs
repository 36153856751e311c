//! Outbox table definition.

use ledger_events_core::outbox::OutboxError;
use sqlx::PgPool;

const CREATE_OUTBOX_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        payload BYTEA NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INT NOT NULL DEFAULT 0,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT outbox_events_status_check
            CHECK (status IN ('pending', 'published', 'failed'))
    )
";

// The processor's only access path: filter by status, oldest first.
const CREATE_STATUS_INDEX: &str = r"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_status_created
        ON outbox_events (status, created_at)
";

/// Create the `outbox_events` table and its index if they do not exist.
///
/// Safe to run on every start.
///
/// # Errors
///
/// Returns [`OutboxError::DatabaseError`] if a statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), OutboxError> {
    for statement in [CREATE_OUTBOX_TABLE, CREATE_STATUS_INDEX] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;
    }

    tracing::info!("Outbox schema is up to date");
    Ok(())
}
