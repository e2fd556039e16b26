use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::EntityType;
use crate::deltas::{
    DeletionRepositoryTrait, DeletionSyncStatus, Delta, DeltaRepositoryTrait, DeltaSyncStatus,
    ItemDeletion,
};
use crate::errors::{DatabaseError, Error, Result};
use crate::mappings::{ItemMapping, MappingRepositoryTrait};
use crate::scope::SyncScope;
use crate::snapshots::{CatalogSnapshot, NewCatalogSnapshot, SnapshotRepositoryTrait};

use super::{read, write};

#[derive(Default)]
pub struct InMemorySnapshotRepository {
    snapshots: RwLock<Vec<CatalogSnapshot>>,
}

impl InMemorySnapshotRepository {
    fn latest_of<'a>(
        snapshots: &'a [CatalogSnapshot],
        scope: &SyncScope,
    ) -> Option<&'a CatalogSnapshot> {
        snapshots
            .iter()
            .filter(|s| &s.scope == scope)
            .max_by_key(|s| s.version)
    }
}

#[async_trait]
impl SnapshotRepositoryTrait for InMemorySnapshotRepository {
    fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<CatalogSnapshot>> {
        Ok(read(&self.snapshots)?
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned())
    }

    fn get_latest(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>> {
        Ok(Self::latest_of(&read(&self.snapshots)?, scope).cloned())
    }

    fn get_latest_submitted(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>> {
        Ok(read(&self.snapshots)?
            .iter()
            .filter(|s| &s.scope == scope && s.is_submitted)
            .max_by_key(|s| s.version)
            .cloned())
    }

    fn get_by_version(&self, scope: &SyncScope, version: i64) -> Result<Option<CatalogSnapshot>> {
        Ok(read(&self.snapshots)?
            .iter()
            .find(|s| &s.scope == scope && s.version == version)
            .cloned())
    }

    fn list_versions(&self, scope: &SyncScope, limit: i64) -> Result<Vec<CatalogSnapshot>> {
        let mut list: Vec<_> = read(&self.snapshots)?
            .iter()
            .filter(|s| &s.scope == scope)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.version.cmp(&a.version));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn insert_snapshot(&self, snapshot: NewCatalogSnapshot) -> Result<CatalogSnapshot> {
        let mut snapshots = write(&self.snapshots)?;
        let latest = Self::latest_of(&snapshots, &snapshot.scope).map_or(0, |s| s.version);
        if snapshot.version != latest + 1 {
            return Err(Error::Conflict(format!(
                "Snapshot version {} for scope {} is taken (latest is {})",
                snapshot.version, snapshot.scope, latest
            )));
        }
        let stored = snapshot.into_snapshot();
        snapshots.push(stored.clone());
        Ok(stored)
    }

    async fn mark_submitted(
        &self,
        snapshot_id: String,
        import_id: Option<String>,
        vendor_ref: String,
        submitted_at: DateTime<Utc>,
    ) -> Result<CatalogSnapshot> {
        let mut snapshots = write(&self.snapshots)?;
        let snapshot = snapshots
            .iter_mut()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| Error::not_found(format!("snapshot {}", snapshot_id)))?;
        snapshot.is_submitted = true;
        snapshot.import_id = import_id;
        snapshot.vendor_ref = Some(vendor_ref);
        snapshot.submitted_at = Some(submitted_at);
        Ok(snapshot.clone())
    }

    async fn prune_before(
        &self,
        scope: SyncScope,
        cutoff: DateTime<Utc>,
        keep_from_version: i64,
    ) -> Result<usize> {
        let mut snapshots = write(&self.snapshots)?;
        let before = snapshots.len();
        snapshots.retain(|s| {
            !(s.scope == scope && s.created_at < cutoff && s.version < keep_from_version)
        });
        Ok(before - snapshots.len())
    }
}

#[derive(Default)]
pub struct InMemoryMappingRepository {
    mappings: RwLock<Vec<ItemMapping>>,
}

impl InMemoryMappingRepository {
    /// Stores `mapping` as-is by id, bypassing upsert rules. Used to seed
    /// inconsistent states.
    pub fn force_insert(&self, mapping: ItemMapping) {
        if let Ok(mut mappings) = self.mappings.write() {
            match mappings.iter_mut().find(|m| m.id == mapping.id) {
                Some(existing) => *existing = mapping,
                None => mappings.push(mapping),
            }
        }
    }
}

#[async_trait]
impl MappingRepositoryTrait for InMemoryMappingRepository {
    fn get_mapping(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<ItemMapping>> {
        Ok(read(&self.mappings)?
            .iter()
            .find(|m| &m.scope == scope && m.entity_type == entity_type && m.source_id == source_id)
            .cloned())
    }

    fn get_mapping_by_id(&self, mapping_id: &str) -> Result<Option<ItemMapping>> {
        Ok(read(&self.mappings)?
            .iter()
            .find(|m| m.id == mapping_id)
            .cloned())
    }

    fn list_mappings(
        &self,
        scope: &SyncScope,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<ItemMapping>> {
        Ok(read(&self.mappings)?
            .iter()
            .filter(|m| &m.scope == scope && entity_type.map_or(true, |t| m.entity_type == t))
            .cloned()
            .collect())
    }

    async fn upsert_mappings(&self, mappings: Vec<ItemMapping>) -> Result<Vec<ItemMapping>> {
        let mut stored = write(&self.mappings)?;
        let mut result = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let existing = stored.iter_mut().find(|m| {
                m.scope == mapping.scope
                    && m.entity_type == mapping.entity_type
                    && m.source_id == mapping.source_id
            });
            match existing {
                Some(row) => {
                    let kept = ItemMapping {
                        id: row.id.clone(),
                        remote_code: row.remote_code.clone(),
                        created_at: row.created_at,
                        ..mapping
                    };
                    *row = kept.clone();
                    result.push(kept);
                }
                None => {
                    stored.push(mapping.clone());
                    result.push(mapping);
                }
            }
        }
        Ok(result)
    }

    async fn mark_synced(&self, mapping_ids: Vec<String>, synced_at: DateTime<Utc>) -> Result<usize> {
        let mut stored = write(&self.mappings)?;
        let mut count = 0;
        for mapping in stored.iter_mut().filter(|m| mapping_ids.contains(&m.id)) {
            mapping.last_synced_at = Some(synced_at);
            mapping.sync_count += 1;
            count += 1;
        }
        Ok(count)
    }
}

#[derive(Default)]
pub struct InMemoryDeltaRepository {
    deltas: RwLock<Vec<Delta>>,
}

#[async_trait]
impl DeltaRepositoryTrait for InMemoryDeltaRepository {
    fn get_delta(&self, delta_id: &str) -> Result<Option<Delta>> {
        Ok(read(&self.deltas)?.iter().find(|d| d.id == delta_id).cloned())
    }

    fn get_for_target(&self, target_snapshot_id: &str) -> Result<Option<Delta>> {
        Ok(read(&self.deltas)?
            .iter()
            .filter(|d| d.target_snapshot_id == target_snapshot_id)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    fn list_deltas(&self, scope: &SyncScope, limit: i64) -> Result<Vec<Delta>> {
        let mut list: Vec<_> = read(&self.deltas)?
            .iter()
            .filter(|d| &d.scope == scope)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }

    async fn insert_delta(&self, delta: Delta) -> Result<Delta> {
        let mut deltas = write(&self.deltas)?;
        if deltas.iter().any(|d| d.id == delta.id) {
            return Err(DatabaseError::UniqueViolation(format!("delta {}", delta.id)).into());
        }
        deltas.push(delta.clone());
        Ok(delta)
    }

    async fn update_delta(&self, delta: Delta) -> Result<Delta> {
        let mut deltas = write(&self.deltas)?;
        let row = deltas
            .iter_mut()
            .find(|d| d.id == delta.id)
            .ok_or_else(|| Error::not_found(format!("delta {}", delta.id)))?;
        *row = delta.clone();
        Ok(delta)
    }

    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut deltas = write(&self.deltas)?;
        let before = deltas.len();
        deltas.retain(|d| {
            !(d.scope == scope
                && d.created_at < cutoff
                && d.sync_status != DeltaSyncStatus::InProgress)
        });
        Ok(before - deltas.len())
    }
}

#[derive(Default)]
pub struct InMemoryDeletionRepository {
    deletions: RwLock<Vec<ItemDeletion>>,
}

#[async_trait]
impl DeletionRepositoryTrait for InMemoryDeletionRepository {
    fn list_deletions(
        &self,
        scope: &SyncScope,
        status: Option<DeletionSyncStatus>,
    ) -> Result<Vec<ItemDeletion>> {
        Ok(read(&self.deletions)?
            .iter()
            .filter(|d| &d.scope == scope && status.map_or(true, |s| d.sync_status == s))
            .cloned()
            .collect())
    }

    fn list_for_delta(&self, delta_id: &str) -> Result<Vec<ItemDeletion>> {
        Ok(read(&self.deletions)?
            .iter()
            .filter(|d| d.delta_id.as_deref() == Some(delta_id))
            .cloned()
            .collect())
    }

    async fn insert_deletions(&self, deletions: Vec<ItemDeletion>) -> Result<usize> {
        let count = deletions.len();
        write(&self.deletions)?.extend(deletions);
        Ok(count)
    }

    async fn update_status(
        &self,
        deletion_ids: Vec<String>,
        status: DeletionSyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut deletions = write(&self.deletions)?;
        let mut count = 0;
        for deletion in deletions.iter_mut().filter(|d| deletion_ids.contains(&d.id)) {
            deletion.sync_status = status;
            match status {
                DeletionSyncStatus::Synced => {
                    deletion.synced_at = Some(at);
                    deletion.last_error = None;
                }
                DeletionSyncStatus::Failed => {
                    deletion.retry_count += 1;
                    deletion.last_error = error.clone();
                }
                DeletionSyncStatus::Pending => {}
            }
            count += 1;
        }
        Ok(count)
    }

    async fn purge_expired(&self, scope: SyncScope, now: DateTime<Utc>) -> Result<usize> {
        let mut deletions = write(&self.deletions)?;
        let before = deletions.len();
        deletions.retain(|d| !(d.scope == scope && d.expires_at <= now));
        Ok(before - deletions.len())
    }
}
