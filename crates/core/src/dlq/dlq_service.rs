use std::sync::Arc;

use chrono::Utc;
use log::{error, warn};
use uuid::Uuid;

use crate::errors::{FailureType, Result};
use crate::scope::SyncScope;

use super::dlq_model::{DeadLetterEntry, DlqPriority, NewDeadLetter};
use super::dlq_traits::DeadLetterRepositoryTrait;

/// Terminal sink for operations that failed permanently or ran out of retries.
#[derive(Clone)]
pub struct DeadLetterQueue {
    repository: Arc<dyn DeadLetterRepositoryTrait>,
}

impl DeadLetterQueue {
    pub fn new(repository: Arc<dyn DeadLetterRepositoryTrait>) -> Self {
        Self { repository }
    }

    pub async fn store_failure(&self, failure: NewDeadLetter) -> Result<DeadLetterEntry> {
        let entry = DeadLetterEntry {
            id: Uuid::now_v7().to_string(),
            correlation_id: failure.correlation_id,
            scope: failure.scope,
            sync_run_id: failure.sync_run_id,
            payload: failure.payload,
            error_code: failure.error_code,
            error_message: failure.error_message,
            failure_type: failure.failure_type,
            attempt_count: failure.attempt_count,
            priority: failure.priority,
            context: failure.context,
            created_at: Utc::now(),
            replayed_by_run_id: None,
            replayed_at: None,
        };

        match entry.failure_type {
            FailureType::Permanent => error!(
                "[MenuSync] Dead-lettered permanent {} failure for scope={} correlation={}: {}",
                entry.payload.operation(),
                entry.scope,
                entry.correlation_id,
                entry.error_message
            ),
            FailureType::Transient => warn!(
                "[MenuSync] Dead-lettered {} after {} attempts for scope={} correlation={}: {}",
                entry.payload.operation(),
                entry.attempt_count,
                entry.scope,
                entry.correlation_id,
                entry.error_message
            ),
        }

        self.repository.insert_entry(entry).await
    }

    pub fn get(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        self.repository.get_entry(entry_id)
    }

    pub fn list(
        &self,
        scope: Option<&SyncScope>,
        min_priority: Option<DlqPriority>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.repository.list_entries(scope, min_priority, limit)
    }

    /// Transient entries eligible for an automated replay.
    pub fn replay_candidates(&self, max_attempts: i32, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.repository
            .list_replayable(FailureType::Transient, max_attempts, limit)
    }

    pub async fn mark_replayed(&self, entry_id: &str, run_id: &str) -> Result<bool> {
        self.repository
            .mark_replayed(entry_id.to_string(), run_id.to_string(), Utc::now())
            .await
    }
}
