use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::scope::SyncScope;

use super::run_model::{SyncRun, SyncRunStep};

/// Persistence contract for sync runs and their step trace.
#[async_trait]
pub trait SyncRunRepositoryTrait: Send + Sync {
    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>>;

    /// Newest first.
    fn list_runs(&self, scope: &SyncScope, limit: i64) -> Result<Vec<SyncRun>>;

    fn list_runs_since(&self, scope: &SyncScope, since: DateTime<Utc>) -> Result<Vec<SyncRun>>;

    /// Retry run created for `parent_run_id`, if any.
    fn find_retry_of(&self, parent_run_id: &str) -> Result<Option<SyncRun>>;

    /// Steps ordered by sequence.
    fn list_steps(&self, run_id: &str) -> Result<Vec<SyncRunStep>>;

    async fn insert_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun>;

    /// Replaces the run row and appends `steps`.
    ///
    /// A step whose `(run_id, sequence)` already exists is ignored, so the
    /// trace is never rewritten.
    async fn save_run(&self, run: SyncRun, steps: Vec<SyncRunStep>) -> Result<SyncRun>;

    /// Deletes terminal runs (with their steps) that finished before `cutoff`.
    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize>;
}
