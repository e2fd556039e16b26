use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::scope::SyncScope;

use super::snapshot_model::{CatalogSnapshot, NewCatalogSnapshot};

/// Persistence contract for catalog snapshots.
#[async_trait]
pub trait SnapshotRepositoryTrait: Send + Sync {
    fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<CatalogSnapshot>>;

    fn get_latest(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>>;

    fn get_latest_submitted(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>>;

    fn get_by_version(&self, scope: &SyncScope, version: i64) -> Result<Option<CatalogSnapshot>>;

    /// Newest first.
    fn list_versions(&self, scope: &SyncScope, limit: i64) -> Result<Vec<CatalogSnapshot>>;

    /// Inserts `snapshot` only if its version is exactly one above the scope's
    /// latest version; otherwise fails with `Error::Conflict`.
    async fn insert_snapshot(&self, snapshot: NewCatalogSnapshot) -> Result<CatalogSnapshot>;

    async fn mark_submitted(
        &self,
        snapshot_id: String,
        import_id: Option<String>,
        vendor_ref: String,
        submitted_at: DateTime<Utc>,
    ) -> Result<CatalogSnapshot>;

    /// Deletes snapshots created before `cutoff` whose version is below
    /// `keep_from_version`. The latest version must always be kept so that
    /// version allocation never reuses a number.
    async fn prune_before(
        &self,
        scope: SyncScope,
        cutoff: DateTime<Utc>,
        keep_from_version: i64,
    ) -> Result<usize>;
}
