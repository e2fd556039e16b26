use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::scope::SyncScope;

use super::deletion_model::{DeletionSyncStatus, ItemDeletion};
use super::delta_model::Delta;

/// Persistence contract for deltas.
#[async_trait]
pub trait DeltaRepositoryTrait: Send + Sync {
    fn get_delta(&self, delta_id: &str) -> Result<Option<Delta>>;

    /// Delta generated for a target snapshot, if one exists.
    fn get_for_target(&self, target_snapshot_id: &str) -> Result<Option<Delta>>;

    /// Newest first.
    fn list_deltas(&self, scope: &SyncScope, limit: i64) -> Result<Vec<Delta>>;

    async fn insert_delta(&self, delta: Delta) -> Result<Delta>;

    async fn update_delta(&self, delta: Delta) -> Result<Delta>;

    /// Deletes deltas created before `cutoff` that are not still in progress.
    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Persistence contract for soft-deletion audit records.
#[async_trait]
pub trait DeletionRepositoryTrait: Send + Sync {
    fn list_deletions(
        &self,
        scope: &SyncScope,
        status: Option<DeletionSyncStatus>,
    ) -> Result<Vec<ItemDeletion>>;

    fn list_for_delta(&self, delta_id: &str) -> Result<Vec<ItemDeletion>>;

    async fn insert_deletions(&self, deletions: Vec<ItemDeletion>) -> Result<usize>;

    /// Sets the sync status; `Failed` also increments the retry count.
    async fn update_status(
        &self,
        deletion_ids: Vec<String>,
        status: DeletionSyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn purge_expired(&self, scope: SyncScope, now: DateTime<Utc>) -> Result<usize>;
}
