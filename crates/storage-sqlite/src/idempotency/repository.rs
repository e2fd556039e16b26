//! Versioned idempotency ledger with compare-and-set writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use menusync_core::errors::Result;
use menusync_core::idempotency::{
    IdempotencyKind, IdempotencyRecord, IdempotencyRepositoryTrait, IdempotencyStatus,
};
use menusync_core::SyncScope;

use super::model::IdempotencyRecordDB;
use crate::conversions::{enum_to_db, ts};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::idempotency_records;

pub struct IdempotencyRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl IdempotencyRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        IdempotencyRepository { pool, writer }
    }
}

#[async_trait]
impl IdempotencyRepositoryTrait for IdempotencyRepository {
    fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = get_connection(&self.pool)?;
        idempotency_records::table
            .find(key)
            .select(IdempotencyRecordDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(IdempotencyRecord::try_from)
            .transpose()
    }

    fn list_in_progress(
        &self,
        scope: &SyncScope,
        kind: IdempotencyKind,
    ) -> Result<Vec<IdempotencyRecord>> {
        let mut conn = get_connection(&self.pool)?;
        idempotency_records::table
            .filter(idempotency_records::scope_key.eq(scope.key()))
            .filter(idempotency_records::kind.eq(enum_to_db(&kind)?))
            .filter(idempotency_records::status.eq(enum_to_db(&IdempotencyStatus::InProgress)?))
            .order(idempotency_records::started_at.asc())
            .select(IdempotencyRecordDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(IdempotencyRecord::try_from)
            .collect()
    }

    async fn compare_and_set(
        &self,
        record: IdempotencyRecord,
        expected_version: Option<i64>,
    ) -> Result<bool> {
        let row = IdempotencyRecordDB::try_from(&record)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<bool> {
                match expected_version {
                    None => {
                        let exists = idempotency_records::table
                            .find(&row.key)
                            .select(idempotency_records::key)
                            .first::<String>(conn)
                            .optional()
                            .map_err(StorageError::from)?
                            .is_some();
                        if exists {
                            return Ok(false);
                        }
                        diesel::insert_into(idempotency_records::table)
                            .values(&row)
                            .execute(conn)
                            .map_err(StorageError::from)?;
                        Ok(true)
                    }
                    Some(expected) => {
                        let updated = diesel::update(
                            idempotency_records::table
                                .filter(idempotency_records::key.eq(&row.key))
                                .filter(idempotency_records::version.eq(expected)),
                        )
                        .set(&row)
                        .execute(conn)
                        .map_err(StorageError::from)?;
                        Ok(updated == 1)
                    }
                }
            })
            .await
    }

    async fn purge_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(
                    idempotency_records::table
                        .filter(idempotency_records::scope_key.eq(scope.key()))
                        .filter(idempotency_records::updated_at.lt(ts(&cutoff))),
                )
                .execute(conn)
                .map_err(StorageError::from)?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use menusync_core::idempotency::{job_key, ClaimDecision, ClaimPolicy, IdempotencyGuard};

    use crate::test_support::setup_db;

    fn record(scope: &SyncScope, key: &str, version: i64) -> IdempotencyRecord {
        let now = Utc::now();
        IdempotencyRecord {
            key: key.to_string(),
            scope: scope.clone(),
            kind: IdempotencyKind::Job,
            status: IdempotencyStatus::InProgress,
            owner_id: "run-1".to_string(),
            version,
            attempt_count: 1,
            started_at: now,
            heartbeat_at: now,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_versions() {
        let (pool, writer) = setup_db();
        let repo = IdempotencyRepository::new(pool, writer);
        let scope = SyncScope::account("acc-1");

        assert!(repo.compare_and_set(record(&scope, "k1", 1), None).await.unwrap());
        assert!(!repo.compare_and_set(record(&scope, "k1", 1), None).await.unwrap());

        let mut next = record(&scope, "k1", 2);
        next.status = IdempotencyStatus::Succeeded;
        next.completed_at = Some(Utc::now());
        assert!(!repo.compare_and_set(next.clone(), Some(5)).await.unwrap());
        assert!(repo.compare_and_set(next, Some(1)).await.unwrap());

        let stored = repo.get_record("k1").unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, IdempotencyStatus::Succeeded);
        assert!(repo
            .list_in_progress(&scope, IdempotencyKind::Job)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn guard_refuses_a_second_live_claim() {
        let (pool, writer) = setup_db();
        let guard = IdempotencyGuard::new(Arc::new(IdempotencyRepository::new(pool, writer)));
        let scope = SyncScope::account("acc-2").with_branch("b1");
        let key = job_key(&scope, Utc::now(), 300);
        let policy = ClaimPolicy::new(Duration::minutes(5));

        let first = guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, &key, "run-a", policy)
            .await
            .unwrap();
        assert_eq!(first.decision, ClaimDecision::Acquired);

        let second = guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, &key, "run-b", policy)
            .await
            .unwrap();
        assert!(!second.can_proceed());

        let lease = first.lease.unwrap();
        assert!(guard.mark_failed(&lease, "vendor down").await.unwrap());
        let retry = guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, &key, "run-b", policy)
            .await
            .unwrap();
        assert_eq!(retry.decision, ClaimDecision::RetryAfterFailure);
    }

    #[tokio::test]
    async fn purge_drops_old_records_of_the_scope() {
        let (pool, writer) = setup_db();
        let repo = IdempotencyRepository::new(pool, writer);
        let scope = SyncScope::account("acc-3");
        let other = SyncScope::account("acc-4");
        repo.compare_and_set(record(&scope, "a", 1), None).await.unwrap();
        repo.compare_and_set(record(&other, "b", 1), None).await.unwrap();

        let purged = repo
            .purge_before(scope.clone(), Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get_record("a").unwrap().is_none());
        assert!(repo.get_record("b").unwrap().is_some());
    }
}
