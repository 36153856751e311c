//! In-memory outbox store for fast, deterministic tests.

use crate::mocks::test_clock;
use ledger_events_core::clock::Clock;
use ledger_events_core::outbox::{
    NewOutboxRecord, OutboxError, OutboxFuture, OutboxRecord, OutboxStatus, OutboxStore,
};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    /// Insertion order; ties on `created_at` keep this order.
    records: Vec<OutboxRecord>,
    fetch_failure: Option<String>,
    save_failure: Option<String>,
    mark_failure: Option<String>,
}

/// In-memory [`OutboxStore`].
///
/// Records are kept in insertion order and returned oldest first. Clones share
/// state, so a test can keep one handle for assertions while the processor
/// owns another.
///
/// # Example
///
/// ```
/// use ledger_events_core::outbox::{NewOutboxRecord, OutboxStore};
/// use ledger_events_testing::InMemoryOutboxStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryOutboxStore::new();
/// let record = NewOutboxRecord::new("AccountCreated", "acct-1", &"payload").unwrap();
/// let id = store.save(record).await.unwrap();
///
/// let pending = store.get_pending_events(10).await.unwrap();
/// assert_eq!(pending[0].id, id);
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    state: Arc<RwLock<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOutboxStore {
    /// Create an empty store stamped by the fixed test clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty store stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            clock,
        }
    }

    /// Insert a fully formed record, for seeding a specific state.
    pub fn insert_record(&self, record: OutboxRecord) {
        self.state.write().unwrap().records.push(record);
    }

    /// Snapshot of every record, in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.state.read().unwrap().records.clone()
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.state
            .read()
            .unwrap()
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Number of records with `status`.
    #[must_use]
    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.state
            .read()
            .unwrap()
            .records
            .iter()
            .filter(|record| record.status == status)
            .count()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().records.is_empty()
    }

    /// Make every fetch fail with `message` until [`heal`](Self::heal) is called.
    pub fn fail_fetches(&self, message: impl Into<String>) {
        self.state.write().unwrap().fetch_failure = Some(message.into());
    }

    /// Make every save fail with `message` until [`heal`](Self::heal) is called.
    pub fn fail_saves(&self, message: impl Into<String>) {
        self.state.write().unwrap().save_failure = Some(message.into());
    }

    /// Make every status update fail with `message` until [`heal`](Self::heal) is called.
    pub fn fail_marks(&self, message: impl Into<String>) {
        self.state.write().unwrap().mark_failure = Some(message.into());
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut state = self.state.write().unwrap();
        state.fetch_failure = None;
        state.save_failure = None;
        state.mark_failure = None;
    }

    fn select(&self, limit: usize, include_failed: bool) -> Result<Vec<OutboxRecord>, OutboxError> {
        let state = self.state.read().unwrap();
        if let Some(message) = &state.fetch_failure {
            return Err(OutboxError::DatabaseError(message.clone()));
        }

        let mut selected: Vec<OutboxRecord> = state
            .records
            .iter()
            .filter(|record| match record.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Failed => include_failed,
                OutboxStatus::Published => false,
            })
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        selected.sort_by_key(|record| record.created_at);
        selected.truncate(limit);
        Ok(selected)
    }

    fn update(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut OutboxRecord),
    ) -> Result<(), OutboxError> {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap();
        if let Some(message) = &state.mark_failure {
            return Err(OutboxError::DatabaseError(message.clone()));
        }

        let record = state
            .records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        apply(record);
        record.updated_at = now;
        Ok(())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn save(&self, record: NewOutboxRecord) -> OutboxFuture<'_, Uuid> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.state.write().unwrap();
            if let Some(message) = &state.save_failure {
                return Err(OutboxError::DatabaseError(message.clone()));
            }

            let id = Uuid::new_v4();
            state.records.push(OutboxRecord {
                id,
                event_type: record.event_type,
                aggregate_id: record.aggregate_id,
                payload: record.payload,
                status: OutboxStatus::Pending,
                retry_count: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            });
            Ok(id)
        })
    }

    fn get_pending_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move { self.select(limit, false) })
    }

    fn get_retryable_events(&self, limit: usize) -> OutboxFuture<'_, Vec<OutboxRecord>> {
        Box::pin(async move { self.select(limit, true) })
    }

    fn mark_as_published(&self, id: Uuid) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |record| record.status = OutboxStatus::Published)
        })
    }

    fn mark_as_failed(&self, id: Uuid, error: String) -> OutboxFuture<'_, ()> {
        Box::pin(async move {
            self.update(id, |record| {
                record.status = OutboxStatus::Failed;
                record.retry_count += 1;
                record.last_error = Some(error);
            })
        })
    }
}
