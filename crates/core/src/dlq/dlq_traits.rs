use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{FailureType, Result};
use crate::scope::SyncScope;

use super::dlq_model::{DeadLetterEntry, DlqPriority};

/// Persistence contract for the dead letter queue.
#[async_trait]
pub trait DeadLetterRepositoryTrait: Send + Sync {
    fn get_entry(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>>;

    /// Newest first, optionally filtered by scope and minimum priority.
    fn list_entries(
        &self,
        scope: Option<&SyncScope>,
        min_priority: Option<DlqPriority>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>>;

    /// Entries not replayed yet with `attempt_count < max_attempts`, oldest first.
    fn list_replayable(
        &self,
        failure_type: FailureType,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>>;

    async fn insert_entry(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry>;

    /// Sets the replay marker once. Returns `false` if it was already set.
    async fn mark_replayed(
        &self,
        entry_id: String,
        run_id: String,
        replayed_at: DateTime<Utc>,
    ) -> Result<bool>;
}
