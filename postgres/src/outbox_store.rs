//! sqlx-backed [`OutboxStore`].

use chrono::{DateTime, Utc};
use ledger_events_core::outbox::{
    NewOutboxRecord, OutboxError, OutboxFuture, OutboxRecord, OutboxStatus, OutboxStore,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const INSERT_RECORD: &str = r"
    INSERT INTO outbox_events (id, event_type, aggregate_id, payload, status, retry_count)
    VALUES ($1, $2, $3, $4, 'pending', 0)
";

const SELECT_COLUMNS: &str = r"
    SELECT id, event_type, aggregate_id, payload, status, retry_count, error,
           created_at, updated_at
    FROM outbox_events
";

/// `PostgreSQL` outbox store.
///
/// Every mutation is a single-row statement, so concurrent writers and the
/// processor never observe a half-applied transition.
///
/// # Example
///
/// ```no_run
/// use ledger_events_core::outbox::NewOutboxRecord;
/// use ledger_events_postgres::PostgresOutboxStore;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// // Write the outbox record in the same transaction as the account update.
/// let mut tx = pool.begin().await?;
/// sqlx::query("UPDATE accounts SET balance = balance + 50 WHERE id = $1")
///     .bind("acct-1")
///     .execute(&mut *tx)
///     .await?;
/// let record = NewOutboxRecord::new(
///     "AccountDeposited",
///     "acct-1",
///     &serde_json::json!({ "amount": 50.0 }),
/// )?;
/// PostgresOutboxStore::save_in_tx(&mut tx, record).await?;
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the pool cannot connect.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OutboxError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for sharing with the rest of the application.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a pending record inside the caller's transaction.
    ///
    /// The record becomes visible to the processor only when `tx` commits, and
    /// disappears with the business write if `tx` rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if the insert fails.
    pub async fn save_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        record: NewOutboxRecord,
    ) -> Result<Uuid, OutboxError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_RECORD)
            .bind(id)
            .bind(&record.event_type)
            .bind(&record.aggregate_id)
            .bind(&record.payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| database_error("save", &e))?;

        record_saved(id, &record);
        Ok(id)
    }

    /// Load a single record.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] for an unknown id or
    /// [`OutboxError::DatabaseError`] if the query fails.
    pub async fn get(&self, id: Uuid) -> Result<OutboxRecord, OutboxError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| database_error("get", &e))?
            .ok_or(OutboxError::NotFound(id))?;

        row_to_record(&row)
    }

    async fn insert(&self, record: NewOutboxRecord) -> Result<Uuid, OutboxError> {
        let id = Uuid::new_v4();
        sqlx::query(INSERT_RECORD)
            .bind(id)
            .bind(&record.event_type)
            .bind(&record.aggregate_id)
            .bind(&record.payload)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error("save", &e))?;

        record_saved(id, &record);
        Ok(id)
    }

    async fn select(
        &self,
        statuses: &[OutboxStatus],
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let statuses: Vec<&str> = statuses.iter().map(OutboxStatus::as_str).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = ANY($1) ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(statuses)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| database_error("fetch", &e))?;

        rows.iter().map(row_to_record).collect()
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'published', updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error("mark_published", &e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }

        tracing::debug!(record_id = %id, "Outbox record marked as published");
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_events
            SET status = 'failed',
                retry_count = retry_count + 1,
                error = $2,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| database_error("mark_failed", &e))?;

        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }

        tracing::debug!(record_id = %id, error = %error, "Outbox record marked as failed");
        Ok(())
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn save(&self, record: NewOutboxRecord) -> OutboxFuture<'_, Uuid> {
        Box::pin(self.insert(record))
    }

    fn get_pending_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move { self.select(&[OutboxStatus::Pending], limit).await })
    }

    fn get_retryable_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move {
            self.select(&[OutboxStatus::Pending, OutboxStatus::Failed], limit)
                .await
        })
    }

    fn mark_as_published(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(self.mark_published(id))
    }

    fn mark_as_failed(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()> {
        Box::pin(self.mark_failed(id, error))
    }
}

fn record_saved(id: Uuid, record: &NewOutboxRecord) {
    tracing::debug!(
        record_id = %id,
        event_type = %record.event_type,
        aggregate_id = %record.aggregate_id,
        "Event saved to outbox"
    );
    metrics::counter!("outbox_events_saved_total", "event_type" => record.event_type.clone())
        .increment(1);
}

fn database_error(operation: &'static str, err: &sqlx::Error) -> OutboxError {
    metrics::counter!("outbox_store_errors_total", "operation" => operation).increment(1);
    OutboxError::DatabaseError(err.to_string())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, OutboxError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| OutboxError::DatabaseError(format!("column '{name}': {e}")))
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, OutboxError> {
    let status: String = column(row, "status")?;

    Ok(OutboxRecord {
        id: column(row, "id")?,
        event_type: column(row, "event_type")?,
        aggregate_id: column(row, "aggregate_id")?,
        payload: column(row, "payload")?,
        status: OutboxStatus::parse(&status)?,
        retry_count: column(row, "retry_count")?,
        last_error: column(row, "error")?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}
