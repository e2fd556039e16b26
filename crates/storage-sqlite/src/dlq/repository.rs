//! Repository for the append-only dead letter queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use menusync_core::dlq::{DeadLetterEntry, DeadLetterRepositoryTrait, DlqPriority};
use menusync_core::errors::{Error, FailureType, Result};
use menusync_core::SyncScope;

use super::model::DeadLetterDB;
use crate::conversions::{enum_to_db, ts};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::dead_letters;

pub struct DeadLetterRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl DeadLetterRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        DeadLetterRepository { pool, writer }
    }
}

fn to_entries(rows: Vec<DeadLetterDB>) -> Result<Vec<DeadLetterEntry>> {
    rows.into_iter().map(DeadLetterEntry::try_from).collect()
}

#[async_trait]
impl DeadLetterRepositoryTrait for DeadLetterRepository {
    fn get_entry(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        let mut conn = get_connection(&self.pool)?;
        dead_letters::table
            .find(entry_id)
            .select(DeadLetterDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(DeadLetterEntry::try_from)
            .transpose()
    }

    fn list_entries(
        &self,
        scope: Option<&SyncScope>,
        min_priority: Option<DlqPriority>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = dead_letters::table
            .select(DeadLetterDB::as_select())
            .into_boxed();
        if let Some(scope) = scope {
            query = query.filter(dead_letters::scope_key.eq(scope.key()));
        }
        if let Some(min_priority) = min_priority {
            query = query.filter(dead_letters::priority_rank.ge(min_priority as i32));
        }
        let rows = query
            .order((dead_letters::created_at.desc(), dead_letters::id.desc()))
            .limit(limit.max(0))
            .load(&mut conn)
            .map_err(StorageError::from)?;
        to_entries(rows)
    }

    fn list_replayable(
        &self,
        failure_type: FailureType,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = dead_letters::table
            .filter(dead_letters::failure_type.eq(enum_to_db(&failure_type)?))
            .filter(dead_letters::replayed_by_run_id.is_null())
            .filter(dead_letters::attempt_count.lt(max_attempts))
            .order((dead_letters::created_at.asc(), dead_letters::id.asc()))
            .limit(limit.max(0))
            .select(DeadLetterDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        to_entries(rows)
    }

    async fn insert_entry(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        let row = DeadLetterDB::try_from(&entry)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<DeadLetterEntry> {
                diesel::insert_into(dead_letters::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(entry)
            })
            .await
    }

    async fn mark_replayed(
        &self,
        entry_id: String,
        run_id: String,
        replayed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<bool> {
                let updated = diesel::update(
                    dead_letters::table
                        .filter(dead_letters::id.eq(&entry_id))
                        .filter(dead_letters::replayed_by_run_id.is_null()),
                )
                .set((
                    dead_letters::replayed_by_run_id.eq(Some(run_id)),
                    dead_letters::replayed_at.eq(Some(ts(&replayed_at))),
                ))
                .execute(conn)
                .map_err(StorageError::from)?;
                if updated == 1 {
                    return Ok(true);
                }

                let exists = dead_letters::table
                    .find(&entry_id)
                    .select(dead_letters::id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .is_some();
                if exists {
                    Ok(false)
                } else {
                    Err(Error::not_found(format!("dead letter {}", entry_id)))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use menusync_core::deltas::DeltaType;
    use menusync_core::dlq::{DeadLetterPayload, DeadLetterQueue, NewDeadLetter};
    use menusync_core::errors::{Collaborator, CollaboratorError};

    use crate::test_support::setup_db;

    fn queue() -> DeadLetterQueue {
        let (pool, writer) = setup_db();
        DeadLetterQueue::new(Arc::new(DeadLetterRepository::new(pool, writer)))
    }

    fn submission_failure(scope: &SyncScope, error: &Error, attempts: i32) -> NewDeadLetter {
        NewDeadLetter::from_error(
            "corr-1",
            scope.clone(),
            DeadLetterPayload::DeltaSubmission {
                force_full: false,
                delta_id: Some("delta-1".to_string()),
                delta_type: DeltaType::Incremental,
                target_version: Some(4),
                total_changes: 3,
            },
            error,
            attempts,
        )
        .with_run("run-1")
        .with_context("vendor", "pos")
    }

    #[tokio::test]
    async fn entries_keep_payload_and_priority() {
        let dlq = queue();
        let scope = SyncScope::account("acc-1").with_branch("b1");
        let transient = Error::Collaborator(CollaboratorError::timeout(
            Collaborator::DeltaSubmission,
            "timed out",
        ));
        let permanent = Error::validation("bad payload");

        let stored = dlq
            .store_failure(submission_failure(&scope, &transient, 3))
            .await
            .unwrap();
        dlq.store_failure(submission_failure(&scope, &permanent, 1))
            .await
            .unwrap();

        let loaded = dlq.get(&stored.id).unwrap().unwrap();
        assert_eq!(loaded.payload, stored.payload);
        assert_eq!(loaded.sync_run_id.as_deref(), Some("run-1"));
        assert_eq!(loaded.priority, DlqPriority::Normal);
        assert_eq!(loaded.context.get("vendor").map(String::as_str), Some("pos"));

        assert_eq!(dlq.list(Some(&scope), None, 10).unwrap().len(), 2);
        let urgent = dlq.list(None, Some(DlqPriority::High), 10).unwrap();
        assert_eq!(urgent.len(), 1);
        assert_eq!(urgent[0].failure_type, FailureType::Permanent);
        assert!(dlq
            .list(Some(&SyncScope::account("other")), None, 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn replay_marker_is_written_once() {
        let dlq = queue();
        let scope = SyncScope::account("acc-2");
        let transient = Error::Conflict("lease lost".to_string());
        let entry = dlq
            .store_failure(submission_failure(&scope, &transient, 2))
            .await
            .unwrap();

        assert_eq!(dlq.replay_candidates(5, 10).unwrap().len(), 1);
        assert!(dlq.replay_candidates(2, 10).unwrap().is_empty());

        assert!(dlq.mark_replayed(&entry.id, "run-2").await.unwrap());
        assert!(!dlq.mark_replayed(&entry.id, "run-3").await.unwrap());
        let loaded = dlq.get(&entry.id).unwrap().unwrap();
        assert_eq!(loaded.replayed_by_run_id.as_deref(), Some("run-2"));
        assert!(dlq.replay_candidates(5, 10).unwrap().is_empty());

        assert!(dlq.mark_replayed("missing", "run-4").await.is_err());
    }
}
