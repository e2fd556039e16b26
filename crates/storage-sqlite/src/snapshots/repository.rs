//! Repository for catalog snapshots.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use log::debug;

use menusync_core::errors::{Error, Result};
use menusync_core::snapshots::{CatalogSnapshot, NewCatalogSnapshot, SnapshotRepositoryTrait};
use menusync_core::SyncScope;

use super::model::CatalogSnapshotDB;
use crate::conversions::ts;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::catalog_snapshots;

pub struct SnapshotRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SnapshotRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        SnapshotRepository { pool, writer }
    }

    fn load_one<F>(&self, query: F) -> Result<Option<CatalogSnapshot>>
    where
        F: FnOnce(&mut SqliteConnection) -> QueryResult<Option<CatalogSnapshotDB>>,
    {
        let mut conn = get_connection(&self.pool)?;
        query(&mut *conn)
            .map_err(StorageError::from)?
            .map(CatalogSnapshot::try_from)
            .transpose()
    }
}

#[async_trait]
impl SnapshotRepositoryTrait for SnapshotRepository {
    fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<CatalogSnapshot>> {
        self.load_one(|conn| {
            catalog_snapshots::table
                .find(snapshot_id)
                .select(CatalogSnapshotDB::as_select())
                .first(conn)
                .optional()
        })
    }

    fn get_latest(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>> {
        let key = scope.key();
        self.load_one(|conn| {
            catalog_snapshots::table
                .filter(catalog_snapshots::scope_key.eq(key))
                .order(catalog_snapshots::version.desc())
                .select(CatalogSnapshotDB::as_select())
                .first(conn)
                .optional()
        })
    }

    fn get_latest_submitted(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>> {
        let key = scope.key();
        self.load_one(|conn| {
            catalog_snapshots::table
                .filter(catalog_snapshots::scope_key.eq(key))
                .filter(catalog_snapshots::is_submitted.eq(true))
                .order(catalog_snapshots::version.desc())
                .select(CatalogSnapshotDB::as_select())
                .first(conn)
                .optional()
        })
    }

    fn get_by_version(&self, scope: &SyncScope, version: i64) -> Result<Option<CatalogSnapshot>> {
        let key = scope.key();
        self.load_one(|conn| {
            catalog_snapshots::table
                .filter(catalog_snapshots::scope_key.eq(key))
                .filter(catalog_snapshots::version.eq(version))
                .select(CatalogSnapshotDB::as_select())
                .first(conn)
                .optional()
        })
    }

    fn list_versions(&self, scope: &SyncScope, limit: i64) -> Result<Vec<CatalogSnapshot>> {
        let mut conn = get_connection(&self.pool)?;
        catalog_snapshots::table
            .filter(catalog_snapshots::scope_key.eq(scope.key()))
            .order(catalog_snapshots::version.desc())
            .limit(limit.max(0))
            .select(CatalogSnapshotDB::as_select())
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(CatalogSnapshot::try_from)
            .collect()
    }

    async fn insert_snapshot(&self, snapshot: NewCatalogSnapshot) -> Result<CatalogSnapshot> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<CatalogSnapshot> {
                let row = CatalogSnapshotDB::from(snapshot);
                let latest: Option<i64> = catalog_snapshots::table
                    .filter(catalog_snapshots::scope_key.eq(&row.scope_key))
                    .select(max(catalog_snapshots::version))
                    .first(conn)
                    .map_err(StorageError::from)?;
                let latest = latest.unwrap_or(0);
                if row.version != latest + 1 {
                    return Err(Error::Conflict(format!(
                        "Snapshot version {} for scope {} is taken (latest is {})",
                        row.version, row.scope_key, latest
                    )));
                }

                match diesel::insert_into(catalog_snapshots::table)
                    .values(&row)
                    .execute(conn)
                {
                    Ok(_) => {}
                    Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                        return Err(Error::Conflict(format!(
                            "Snapshot version {} for scope {} is taken",
                            row.version, row.scope_key
                        )));
                    }
                    Err(err) => return Err(StorageError::from(err).into()),
                }
                debug!(
                    "[MenuSync] Stored snapshot v{} for {}",
                    row.version, row.scope_key
                );
                CatalogSnapshot::try_from(row)
            })
            .await
    }

    async fn mark_submitted(
        &self,
        snapshot_id: String,
        import_id: Option<String>,
        vendor_ref: String,
        submitted_at: DateTime<Utc>,
    ) -> Result<CatalogSnapshot> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<CatalogSnapshot> {
                let row = diesel::update(catalog_snapshots::table.find(&snapshot_id))
                    .set((
                        catalog_snapshots::is_submitted.eq(true),
                        catalog_snapshots::import_id.eq(import_id),
                        catalog_snapshots::vendor_ref.eq(Some(vendor_ref)),
                        catalog_snapshots::submitted_at.eq(Some(ts(&submitted_at))),
                    ))
                    .returning(CatalogSnapshotDB::as_returning())
                    .get_result(conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .ok_or_else(|| Error::not_found(format!("snapshot {}", snapshot_id)))?;
                CatalogSnapshot::try_from(row)
            })
            .await
    }

    async fn prune_before(
        &self,
        scope: SyncScope,
        cutoff: DateTime<Utc>,
        keep_from_version: i64,
    ) -> Result<usize> {
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(
                    catalog_snapshots::table
                        .filter(catalog_snapshots::scope_key.eq(scope.key()))
                        .filter(catalog_snapshots::created_at.lt(ts(&cutoff)))
                        .filter(catalog_snapshots::version.lt(keep_from_version)),
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
    use menusync_core::catalog::CatalogCounts;

    use crate::test_support::setup_db;

    fn new_snapshot(scope: &SyncScope, version: i64, hash: &str) -> NewCatalogSnapshot {
        NewCatalogSnapshot {
            id: uuid::Uuid::now_v7().to_string(),
            scope: scope.clone(),
            version,
            content_hash: hash.to_string(),
            counts: CatalogCounts {
                products: 3,
                categories: 1,
                modifiers: 0,
                modifier_options: 0,
            },
            payload: Some(vec![1, 2, 3]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn versions_are_allocated_in_sequence() {
        let (pool, writer) = setup_db();
        let repo = SnapshotRepository::new(pool, writer);
        let scope = SyncScope::account("acc-1").with_branch("b1");

        let first = repo.insert_snapshot(new_snapshot(&scope, 1, "h1")).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.payload, Some(vec![1, 2, 3]));

        let skipped = repo.insert_snapshot(new_snapshot(&scope, 3, "h3")).await;
        assert!(matches!(skipped, Err(Error::Conflict(_))));
        let reused = repo.insert_snapshot(new_snapshot(&scope, 1, "h1b")).await;
        assert!(matches!(reused, Err(Error::Conflict(_))));

        repo.insert_snapshot(new_snapshot(&scope, 2, "h2")).await.unwrap();
        let other_scope = SyncScope::account("acc-1");
        repo.insert_snapshot(new_snapshot(&other_scope, 1, "x1"))
            .await
            .unwrap();

        let latest = repo.get_latest(&scope).unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.scope, scope);
        let versions: Vec<i64> = repo
            .list_versions(&scope, 10)
            .unwrap()
            .iter()
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![2, 1]);
        assert_eq!(repo.get_by_version(&scope, 1).unwrap().unwrap().content_hash, "h1");
    }

    #[tokio::test]
    async fn submission_marks_the_baseline() {
        let (pool, writer) = setup_db();
        let repo = SnapshotRepository::new(pool, writer);
        let scope = SyncScope::account("acc-2");

        let v1 = repo.insert_snapshot(new_snapshot(&scope, 1, "h1")).await.unwrap();
        repo.insert_snapshot(new_snapshot(&scope, 2, "h2")).await.unwrap();
        assert!(repo.get_latest_submitted(&scope).unwrap().is_none());

        let submitted = repo
            .mark_submitted(v1.id.clone(), Some("imp-1".into()), "ref-1".into(), Utc::now())
            .await
            .unwrap();
        assert!(submitted.is_submitted);
        assert_eq!(submitted.vendor_ref.as_deref(), Some("ref-1"));

        let baseline = repo.get_latest_submitted(&scope).unwrap().unwrap();
        assert_eq!(baseline.id, v1.id);
        assert!(baseline.submitted_at.is_some());

        let missing = repo
            .mark_submitted("nope".into(), None, "ref".into(), Utc::now())
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn pruning_keeps_recent_versions() {
        let (pool, writer) = setup_db();
        let repo = SnapshotRepository::new(pool, writer);
        let scope = SyncScope::account("acc-3");
        for version in 1..=3 {
            repo.insert_snapshot(new_snapshot(&scope, version, &format!("h{}", version)))
                .await
                .unwrap();
        }

        let removed = repo
            .prune_before(scope.clone(), Utc::now() + Duration::hours(1), 3)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.list_versions(&scope, 10).unwrap().len(), 1);
        let next = repo.insert_snapshot(new_snapshot(&scope, 4, "h4")).await.unwrap();
        assert_eq!(next.version, 4);
    }
}
