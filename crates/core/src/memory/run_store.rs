use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dlq::{DeadLetterEntry, DeadLetterRepositoryTrait, DlqPriority};
use crate::errors::{DatabaseError, Error, FailureType, Result};
use crate::idempotency::{
    IdempotencyKind, IdempotencyRecord, IdempotencyRepositoryTrait, IdempotencyStatus,
};
use crate::runs::{SyncRun, SyncRunRepositoryTrait, SyncRunStep};
use crate::scope::SyncScope;

use super::{read, write};

#[derive(Default)]
pub struct InMemoryIdempotencyRepository {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyRepository {
    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>>> {
        self.records
            .lock()
            .map_err(|_| Error::internal("idempotency store lock poisoned"))
    }
}

#[async_trait]
impl IdempotencyRepositoryTrait for InMemoryIdempotencyRepository {
    fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.records()?.get(key).cloned())
    }

    fn list_in_progress(
        &self,
        scope: &SyncScope,
        kind: IdempotencyKind,
    ) -> Result<Vec<IdempotencyRecord>> {
        Ok(self
            .records()?
            .values()
            .filter(|r| {
                &r.scope == scope && r.kind == kind && r.status == IdempotencyStatus::InProgress
            })
            .cloned()
            .collect())
    }

    async fn compare_and_set(
        &self,
        record: IdempotencyRecord,
        expected_version: Option<i64>,
    ) -> Result<bool> {
        let mut records = self.records()?;
        let current = records.get(&record.key).map(|r| r.version);
        if current != expected_version {
            return Ok(false);
        }
        records.insert(record.key.clone(), record);
        Ok(true)
    }

    async fn purge_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records()?;
        let before = records.len();
        records.retain(|_, r| !(r.scope == scope && r.updated_at < cutoff));
        Ok(before - records.len())
    }
}

#[derive(Default)]
pub struct InMemorySyncRunRepository {
    runs: RwLock<HashMap<String, SyncRun>>,
    steps: RwLock<BTreeMap<(String, i64), SyncRunStep>>,
}

impl InMemorySyncRunRepository {
    fn append_steps(&self, steps: Vec<SyncRunStep>) -> Result<()> {
        let mut stored = write(&self.steps)?;
        for step in steps {
            stored
                .entry((step.run_id.clone(), step.sequence))
                .or_insert(step);
        }
        Ok(())
    }
}

fn newest_first(runs: &mut [SyncRun]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

#[async_trait]
impl SyncRunRepositoryTrait for InMemorySyncRunRepository {
    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        Ok(read(&self.runs)?.get(run_id).cloned())
    }

    fn list_runs(&self, scope: &SyncScope, limit: i64) -> Result<Vec<SyncRun>> {
        let mut runs: Vec<_> = read(&self.runs)?
            .values()
            .filter(|r| &r.scope == scope)
            .cloned()
            .collect();
        newest_first(&mut runs);
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    fn list_runs_since(&self, scope: &SyncScope, since: DateTime<Utc>) -> Result<Vec<SyncRun>> {
        let mut runs: Vec<_> = read(&self.runs)?
            .values()
            .filter(|r| &r.scope == scope && r.created_at >= since)
            .cloned()
            .collect();
        newest_first(&mut runs);
        Ok(runs)
    }

    fn find_retry_of(&self, parent_run_id: &str) -> Result<Option<SyncRun>> {
        Ok(read(&self.runs)?
            .values()
            .find(|r| r.parent_run_id.as_deref() == Some(parent_run_id))
            .cloned())
    }

    fn list_steps(&self, run_id: &str) -> Result<Vec<SyncRunStep>> {
        Ok(read(&self.steps)?
            .iter()
            .filter(|((id, _), _)| id == run_id)
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn insert_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun> {
        {
            let mut runs = write(&self.runs)?;
            if runs.contains_key(&run.id) {
                return Err(DatabaseError::UniqueViolation(format!("sync run {}", run.id)).into());
            }
            runs.insert(run.id.clone(), run.clone());
        }
        self.append_steps(steps)?;
        Ok(run)
    }

    async fn save_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun> {
        {
            let mut runs = write(&self.runs)?;
            let row = runs
                .get_mut(&run.id)
                .ok_or_else(|| Error::not_found(format!("sync run {}", run.id)))?;
            *row = run.clone();
        }
        self.append_steps(steps)?;
        Ok(run)
    }

    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        let pruned: Vec<String> = {
            let mut runs = write(&self.runs)?;
            let ids: Vec<String> = runs
                .values()
                .filter(|r| {
                    r.scope == scope
                        && r.status.is_terminal()
                        && r.completed_at.is_some_and(|at| at < cutoff)
                })
                .map(|r| r.id.clone())
                .collect();
            for id in &ids {
                runs.remove(id);
            }
            ids
        };
        write(&self.steps)?.retain(|(run_id, _), _| !pruned.contains(run_id));
        Ok(pruned.len())
    }
}

#[derive(Default)]
pub struct InMemoryDeadLetterRepository {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

#[async_trait]
impl DeadLetterRepositoryTrait for InMemoryDeadLetterRepository {
    fn get_entry(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(read(&self.entries)?
            .iter()
            .find(|e| e.id == entry_id)
            .cloned())
    }

    fn list_entries(
        &self,
        scope: Option<&SyncScope>,
        min_priority: Option<DlqPriority>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut list: Vec<_> = read(&self.entries)?
            .iter()
            .filter(|e| scope.map_or(true, |s| &e.scope == s))
            .filter(|e| min_priority.map_or(true, |p| e.priority >= p))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    fn list_replayable(
        &self,
        failure_type: FailureType,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut list: Vec<_> = read(&self.entries)?
            .iter()
            .filter(|e| {
                e.failure_type == failure_type
                    && !e.is_replayed()
                    && e.attempt_count < max_attempts
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn insert_entry(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        write(&self.entries)?.push(entry.clone());
        Ok(entry)
    }

    async fn mark_replayed(
        &self,
        entry_id: String,
        run_id: String,
        replayed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entries = write(&self.entries)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| Error::not_found(format!("dead letter {}", entry_id)))?;
        if entry.is_replayed() {
            return Ok(false);
        }
        entry.replayed_by_run_id = Some(run_id);
        entry.replayed_at = Some(replayed_at);
        Ok(true)
    }
}
