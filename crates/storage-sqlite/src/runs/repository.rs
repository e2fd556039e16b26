//! Repository for sync runs and their append-only step trace.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use menusync_core::errors::{Error, Result};
use menusync_core::runs::{SyncRun, SyncRunRepositoryTrait, SyncRunStatus, SyncRunStep};
use menusync_core::SyncScope;

use super::model::{SyncRunDB, SyncRunStepDB};
use crate::conversions::ts;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{sync_run_steps, sync_runs};

const TERMINAL_STATUSES: [SyncRunStatus; 3] = [
    SyncRunStatus::Completed,
    SyncRunStatus::Failed,
    SyncRunStatus::Cancelled,
];

pub struct SyncRunRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncRunRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        SyncRunRepository { pool, writer }
    }
}

fn to_runs(rows: Vec<SyncRunDB>) -> Result<Vec<SyncRun>> {
    rows.into_iter().map(SyncRun::try_from).collect()
}

/// Appends steps; an existing `(run_id, sequence)` is left untouched.
fn append_steps(conn: &mut SqliteConnection, steps: &[SyncRunStep]) -> Result<usize> {
    let mut appended = 0;
    for step in steps {
        let row = SyncRunStepDB::try_from(step)?;
        appended += diesel::insert_or_ignore_into(sync_run_steps::table)
            .values(&row)
            .execute(conn)
            .map_err(StorageError::from)?;
    }
    Ok(appended)
}

#[async_trait]
impl SyncRunRepositoryTrait for SyncRunRepository {
    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let mut conn = get_connection(&self.pool)?;
        sync_runs::table
            .find(run_id)
            .select(SyncRunDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(SyncRun::try_from)
            .transpose()
    }

    fn list_runs(&self, scope: &SyncScope, limit: i64) -> Result<Vec<SyncRun>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_runs::table
            .filter(sync_runs::scope_key.eq(scope.key()))
            .order((sync_runs::created_at.desc(), sync_runs::id.desc()))
            .limit(limit.max(0))
            .select(SyncRunDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        to_runs(rows)
    }

    fn list_runs_since(&self, scope: &SyncScope, since: DateTime<Utc>) -> Result<Vec<SyncRun>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_runs::table
            .filter(sync_runs::scope_key.eq(scope.key()))
            .filter(sync_runs::created_at.ge(ts(&since)))
            .order((sync_runs::created_at.desc(), sync_runs::id.desc()))
            .select(SyncRunDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        to_runs(rows)
    }

    fn find_retry_of(&self, parent_run_id: &str) -> Result<Option<SyncRun>> {
        let mut conn = get_connection(&self.pool)?;
        sync_runs::table
            .filter(sync_runs::parent_run_id.eq(parent_run_id))
            .order(sync_runs::created_at.desc())
            .select(SyncRunDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(SyncRun::try_from)
            .transpose()
    }

    fn list_steps(&self, run_id: &str) -> Result<Vec<SyncRunStep>> {
        let mut conn = get_connection(&self.pool)?;
        sync_run_steps::table
            .filter(sync_run_steps::run_id.eq(run_id))
            .order(sync_run_steps::sequence.asc())
            .select(SyncRunStepDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(SyncRunStep::try_from)
            .collect()
    }

    async fn insert_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun> {
        let row = SyncRunDB::try_from(&run)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncRun> {
                diesel::insert_into(sync_runs::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                append_steps(conn, &steps)?;
                Ok(run)
            })
            .await
    }

    async fn save_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun> {
        let row = SyncRunDB::try_from(&run)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<SyncRun> {
                let updated = diesel::update(sync_runs::table.find(&row.id))
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if updated == 0 {
                    return Err(Error::not_found(format!("sync run {}", row.id)));
                }
                append_steps(conn, &steps)?;
                Ok(run)
            })
            .await
    }

    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        let terminal: Vec<&'static str> = TERMINAL_STATUSES.iter().map(|s| s.as_str()).collect();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let run_ids: Vec<String> = sync_runs::table
                    .filter(sync_runs::scope_key.eq(scope.key()))
                    .filter(sync_runs::status.eq_any(terminal))
                    .filter(sync_runs::completed_at.lt(ts(&cutoff)))
                    .select(sync_runs::id)
                    .load(conn)
                    .map_err(StorageError::from)?;
                if run_ids.is_empty() {
                    return Ok(0);
                }

                let steps = diesel::delete(
                    sync_run_steps::table.filter(sync_run_steps::run_id.eq_any(&run_ids)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                let runs = diesel::delete(sync_runs::table.filter(sync_runs::id.eq_any(&run_ids)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                debug!(
                    "[MenuSync] Pruned {} runs and {} steps for {}",
                    runs,
                    steps,
                    scope.key()
                );
                Ok(runs)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use menusync_core::errors::FailureType;
    use menusync_core::runs::{
        NewSyncRun, RunOutcome, StepData, StepType, SyncPhase, SyncType, TriggerSource,
    };

    use crate::test_support::setup_db;

    fn new_run(scope: &SyncScope, parent: Option<&SyncRun>) -> (SyncRun, SyncRunStep) {
        SyncRun::new(
            NewSyncRun {
                id: uuid::Uuid::now_v7().to_string(),
                correlation_id: uuid::Uuid::now_v7().to_string(),
                scope: scope.clone(),
                sync_type: SyncType::Incremental,
                trigger_source: TriggerSource::Manual,
                initiated_by: Some("ops".to_string()),
                max_retries: 3,
            },
            parent,
        )
    }

    #[tokio::test]
    async fn saving_appends_steps_without_rewriting_them() {
        let (pool, writer) = setup_db();
        let repo = SyncRunRepository::new(pool, writer);
        let scope = SyncScope::account("acc-1").with_branch("b1");

        let (mut run, created) = new_run(&scope, None);
        repo.insert_run(run.clone(), vec![created.clone()])
            .await
            .unwrap();

        let started = run.start().unwrap();
        let phase = run.enter_phase(SyncPhase::DataFetch).unwrap();
        let mut rewritten = created.clone();
        rewritten.message = "rewritten".to_string();
        repo.save_run(run.clone(), vec![rewritten, started, phase])
            .await
            .unwrap();

        let steps = repo.list_steps(&run.id).unwrap();
        let sequences: Vec<i64> = steps.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(steps[0].message, created.message);
        assert_eq!(steps[1].step_type, StepType::Started);
        assert!(matches!(steps[2].data, Some(StepData::Progress { .. })));

        let loaded = repo.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, SyncRunStatus::Running);
        assert_eq!(loaded.current_phase, Some(SyncPhase::DataFetch));
        assert_eq!(loaded.step_count, 3);
    }

    #[tokio::test]
    async fn failed_runs_keep_errors_and_retry_links() {
        let (pool, writer) = setup_db();
        let repo = SyncRunRepository::new(pool, writer);
        let scope = SyncScope::account("acc-2");

        let (mut parent, created) = new_run(&scope, None);
        repo.insert_run(parent.clone(), vec![created]).await.unwrap();
        let started = parent.start().unwrap();
        let failed = parent
            .fail(&Error::Conflict("lease lost".to_string()), 1)
            .unwrap();
        repo.save_run(parent.clone(), vec![started, failed])
            .await
            .unwrap();

        let (retry, retry_created) = new_run(&scope, Some(&parent));
        repo.insert_run(retry.clone(), vec![retry_created])
            .await
            .unwrap();

        let loaded = repo.get_run(&parent.id).unwrap().unwrap();
        assert_eq!(loaded.failure_type, Some(FailureType::Transient));
        assert_eq!(loaded.errors.len(), 1);
        assert!(loaded.completed_at.is_some());

        let found = repo.find_retry_of(&parent.id).unwrap().unwrap();
        assert_eq!(found.id, retry.id);
        assert_eq!(found.retry_count, 1);
        assert_eq!(repo.list_runs(&scope, 10).unwrap().len(), 2);
        assert_eq!(
            repo.list_runs_since(&scope, Utc::now() - Duration::hours(1))
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn pruning_removes_only_finished_runs() {
        let (pool, writer) = setup_db();
        let repo = SyncRunRepository::new(pool, writer);
        let scope = SyncScope::account("acc-3");

        let (mut done, created) = new_run(&scope, None);
        repo.insert_run(done.clone(), vec![created]).await.unwrap();
        let started = done.start().unwrap();
        let completed = done.complete(RunOutcome::Unchanged).unwrap();
        repo.save_run(done.clone(), vec![started, completed])
            .await
            .unwrap();

        let (active, active_created) = new_run(&scope, None);
        repo.insert_run(active.clone(), vec![active_created])
            .await
            .unwrap();

        let pruned = repo
            .prune_before(scope.clone(), Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(repo.get_run(&done.id).unwrap().is_none());
        assert!(repo.list_steps(&done.id).unwrap().is_empty());
        assert!(repo.get_run(&active.id).unwrap().is_some());
    }
}
