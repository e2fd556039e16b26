//! Repositories for deltas and the soft-deletion audit trail.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use menusync_core::deltas::{
    DeletionRepositoryTrait, DeletionSyncStatus, Delta, DeltaRepositoryTrait, DeltaSyncStatus,
    ItemDeletion,
};
use menusync_core::errors::{Error, Result};
use menusync_core::SyncScope;

use super::model::{ItemDeletionDB, MenuDeltaDB};
use crate::conversions::{enum_to_db, ts};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{item_deletions, menu_deltas};

pub struct DeltaRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl DeltaRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        DeltaRepository { pool, writer }
    }
}

#[async_trait]
impl DeltaRepositoryTrait for DeltaRepository {
    fn get_delta(&self, delta_id: &str) -> Result<Option<Delta>> {
        let mut conn = get_connection(&self.pool)?;
        menu_deltas::table
            .find(delta_id)
            .select(MenuDeltaDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(Delta::try_from)
            .transpose()
    }

    fn get_for_target(&self, target_snapshot_id: &str) -> Result<Option<Delta>> {
        let mut conn = get_connection(&self.pool)?;
        menu_deltas::table
            .filter(menu_deltas::target_snapshot_id.eq(target_snapshot_id))
            .order((menu_deltas::created_at.desc(), menu_deltas::id.desc()))
            .select(MenuDeltaDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(Delta::try_from)
            .transpose()
    }

    fn list_deltas(&self, scope: &SyncScope, limit: i64) -> Result<Vec<Delta>> {
        let mut conn = get_connection(&self.pool)?;
        menu_deltas::table
            .filter(menu_deltas::scope_key.eq(scope.key()))
            .order((menu_deltas::created_at.desc(), menu_deltas::id.desc()))
            .limit(limit.max(0))
            .select(MenuDeltaDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(Delta::try_from)
            .collect()
    }

    async fn insert_delta(&self, delta: Delta) -> Result<Delta> {
        let row = MenuDeltaDB::try_from(&delta)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<Delta> {
                diesel::insert_into(menu_deltas::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(delta)
            })
            .await
    }

    async fn update_delta(&self, delta: Delta) -> Result<Delta> {
        let row = MenuDeltaDB::try_from(&delta)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<Delta> {
                let updated = diesel::update(menu_deltas::table.find(&row.id))
                    .set(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if updated == 0 {
                    return Err(Error::not_found(format!("delta {}", row.id)));
                }
                Ok(delta)
            })
            .await
    }

    async fn prune_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        let in_progress = enum_to_db(&DeltaSyncStatus::InProgress)?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(
                    menu_deltas::table
                        .filter(menu_deltas::scope_key.eq(scope.key()))
                        .filter(menu_deltas::created_at.lt(ts(&cutoff)))
                        .filter(menu_deltas::sync_status.ne(in_progress)),
                )
                .execute(conn)
                .map_err(StorageError::from)?)
            })
            .await
    }
}

pub struct DeletionRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl DeletionRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        DeletionRepository { pool, writer }
    }
}

#[async_trait]
impl DeletionRepositoryTrait for DeletionRepository {
    fn list_deletions(
        &self,
        scope: &SyncScope,
        status: Option<DeletionSyncStatus>,
    ) -> Result<Vec<ItemDeletion>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = item_deletions::table
            .filter(item_deletions::scope_key.eq(scope.key()))
            .select(ItemDeletionDB::as_select())
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(item_deletions::sync_status.eq(status.as_str()));
        }
        query
            .order((item_deletions::created_at.asc(), item_deletions::id.asc()))
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(ItemDeletion::try_from)
            .collect()
    }

    fn list_for_delta(&self, delta_id: &str) -> Result<Vec<ItemDeletion>> {
        let mut conn = get_connection(&self.pool)?;
        item_deletions::table
            .filter(item_deletions::delta_id.eq(delta_id))
            .order((item_deletions::created_at.asc(), item_deletions::id.asc()))
            .select(ItemDeletionDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(ItemDeletion::try_from)
            .collect()
    }

    async fn insert_deletions(&self, deletions: Vec<ItemDeletion>) -> Result<usize> {
        if deletions.is_empty() {
            return Ok(0);
        }
        let rows = deletions
            .iter()
            .map(ItemDeletionDB::try_from)
            .collect::<Result<Vec<_>>>()?;
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let inserted = diesel::insert_into(item_deletions::table)
                    .values(&rows)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                debug!("[MenuSync] Recorded {} deletion audits", inserted);
                Ok(inserted)
            })
            .await
    }

    async fn update_status(
        &self,
        deletion_ids: Vec<String>,
        status: DeletionSyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        if deletion_ids.is_empty() {
            return Ok(0);
        }
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let target = item_deletions::table.filter(item_deletions::id.eq_any(deletion_ids));
                let updated = match status {
                    DeletionSyncStatus::Synced => diesel::update(target)
                        .set((
                            item_deletions::sync_status.eq(status.as_str()),
                            item_deletions::synced_at.eq(Some(ts(&at))),
                            item_deletions::last_error.eq(None::<String>),
                        ))
                        .execute(conn),
                    DeletionSyncStatus::Failed => diesel::update(target)
                        .set((
                            item_deletions::sync_status.eq(status.as_str()),
                            item_deletions::retry_count.eq(item_deletions::retry_count + 1),
                            item_deletions::last_error.eq(error),
                        ))
                        .execute(conn),
                    DeletionSyncStatus::Pending => diesel::update(target)
                        .set(item_deletions::sync_status.eq(status.as_str()))
                        .execute(conn),
                }
                .map_err(StorageError::from)?;
                Ok(updated)
            })
            .await
    }

    async fn purge_expired(&self, scope: SyncScope, now: DateTime<Utc>) -> Result<usize> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(
                    item_deletions::table
                        .filter(item_deletions::scope_key.eq(scope.key()))
                        .filter(item_deletions::expires_at.le(ts(&now))),
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
    use menusync_core::catalog::{CatalogEntity, EntityType, Product};
    use menusync_core::deltas::{DeletionReason, DeletionSource, DeltaType};
    use rust_decimal_macros::dec;

    use crate::test_support::setup_db;

    fn delta(scope: &SyncScope, target: &str, status: DeltaSyncStatus) -> Delta {
        let now = Utc::now();
        Delta {
            id: uuid::Uuid::now_v7().to_string(),
            scope: scope.clone(),
            source_snapshot_id: None,
            source_version: None,
            target_snapshot_id: target.to_string(),
            target_version: 1,
            delta_type: DeltaType::FirstSync,
            added_count: 2,
            updated_count: 0,
            removed_count: 0,
            soft_deleted_count: 0,
            payload: Some(vec![9, 9]),
            sync_status: status,
            retry_count: 0,
            sync_run_id: Some("run-1".to_string()),
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn deletion(scope: &SyncScope, source_id: &str, expires_at: DateTime<Utc>) -> ItemDeletion {
        ItemDeletion {
            id: uuid::Uuid::now_v7().to_string(),
            scope: scope.clone(),
            entity_type: EntityType::Product,
            source_id: source_id.to_string(),
            remote_code: format!("PRD-{}", source_id),
            name: "Flat White".to_string(),
            reason: DeletionReason::RemovedFromSource,
            source: DeletionSource::CatalogSync,
            entity_snapshot: CatalogEntity::Product(Product {
                id: source_id.to_string(),
                name: "Flat White".to_string(),
                description: None,
                price: dec!(4.50),
                category_id: Some("coffee".to_string()),
                modifier_ids: vec![],
                menu_group_ids: vec![],
                is_active: true,
                is_deleted: false,
            }),
            delta_id: Some("delta-1".to_string()),
            snapshot_version: Some(2),
            sync_status: DeletionSyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            synced_at: None,
            expires_at,
        }
    }

    #[tokio::test]
    async fn delta_status_updates_are_persisted() {
        let (pool, writer) = setup_db();
        let repo = DeltaRepository::new(pool, writer);
        let scope = SyncScope::account("acc-1");

        let mut stored = repo
            .insert_delta(delta(&scope, "snap-1", DeltaSyncStatus::Pending))
            .await
            .unwrap();
        stored.sync_status = DeltaSyncStatus::Failed;
        stored.retry_count = 1;
        stored.last_error = Some("vendor down".to_string());
        repo.update_delta(stored.clone()).await.unwrap();

        let loaded = repo.get_for_target("snap-1").unwrap().unwrap();
        assert_eq!(loaded.id, stored.id);
        assert_eq!(loaded.sync_status, DeltaSyncStatus::Failed);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.payload, Some(vec![9, 9]));

        stored.last_error = None;
        repo.update_delta(stored.clone()).await.unwrap();
        assert!(repo.get_delta(&stored.id).unwrap().unwrap().last_error.is_none());

        let missing = repo
            .update_delta(delta(&scope, "snap-2", DeltaSyncStatus::Pending))
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn pruning_skips_in_progress_deltas() {
        let (pool, writer) = setup_db();
        let repo = DeltaRepository::new(pool, writer);
        let scope = SyncScope::account("acc-2");

        repo.insert_delta(delta(&scope, "snap-1", DeltaSyncStatus::Completed))
            .await
            .unwrap();
        repo.insert_delta(delta(&scope, "snap-2", DeltaSyncStatus::InProgress))
            .await
            .unwrap();

        let removed = repo
            .prune_before(scope.clone(), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = repo.list_deltas(&scope, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sync_status, DeltaSyncStatus::InProgress);
    }

    #[tokio::test]
    async fn deletion_audit_tracks_retries_and_expiry() {
        let (pool, writer) = setup_db();
        let repo = DeletionRepository::new(pool, writer);
        let scope = SyncScope::account("acc-3").with_branch("main");
        let now = Utc::now();

        let expired = deletion(&scope, "p1", now - Duration::days(1));
        let fresh = deletion(&scope, "p2", now + Duration::days(30));
        let fresh_id = fresh.id.clone();
        assert_eq!(repo.insert_deletions(vec![expired, fresh]).await.unwrap(), 2);

        repo.update_status(
            vec![fresh_id.clone()],
            DeletionSyncStatus::Failed,
            Some("timeout".to_string()),
            now,
        )
        .await
        .unwrap();
        let failed = repo
            .list_deletions(&scope, Some(DeletionSyncStatus::Failed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].entity_snapshot.entity_type(), EntityType::Product);

        repo.update_status(vec![fresh_id.clone()], DeletionSyncStatus::Synced, None, now)
            .await
            .unwrap();
        let synced = &repo.list_for_delta("delta-1").unwrap();
        let synced = synced.iter().find(|d| d.id == fresh_id).unwrap();
        assert!(synced.last_error.is_none());
        assert!(synced.synced_at.is_some());

        assert_eq!(repo.purge_expired(scope.clone(), now).await.unwrap(), 1);
        assert_eq!(repo.list_deletions(&scope, None).unwrap().len(), 1);
    }
}
