//! Hash-gated change detection and snapshot version allocation.

use std::sync::Arc;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::catalog::{compress_json, content_hash, decompress_json, normalize, Catalog};
use crate::errors::{Error, Result};
use crate::scope::SyncScope;

use super::snapshot_model::{CatalogSnapshot, ChangeDetectionResult, NewCatalogSnapshot};
use super::snapshot_traits::SnapshotRepositoryTrait;

/// Decides whether a scope's catalog changed since the last submitted snapshot.
///
/// The content hash comparison is the only gate for downstream work: an
/// unchanged catalog must not cause any delta, mapping or submission write.
#[derive(Clone)]
pub struct ChangeDetector {
    repository: Arc<dyn SnapshotRepositoryTrait>,
    store_payload: bool,
}

impl ChangeDetector {
    pub fn new(repository: Arc<dyn SnapshotRepositoryTrait>) -> Self {
        Self {
            repository,
            store_payload: true,
        }
    }

    /// Controls whether snapshots keep a compressed copy of the catalog.
    pub fn with_payload_storage(mut self, store_payload: bool) -> Self {
        self.store_payload = store_payload;
        self
    }

    pub fn repository(&self) -> &Arc<dyn SnapshotRepositoryTrait> {
        &self.repository
    }

    pub fn detect_changes(
        &self,
        scope: &SyncScope,
        current: &Catalog,
    ) -> Result<ChangeDetectionResult> {
        let current_hash = content_hash(current)?;
        self.detect_changes_for_hash(scope, current_hash)
    }

    pub fn detect_changes_for_hash(
        &self,
        scope: &SyncScope,
        current_hash: String,
    ) -> Result<ChangeDetectionResult> {
        let latest_snapshot = self.repository.get_latest(scope)?;
        let baseline_snapshot = match latest_snapshot.as_ref() {
            Some(latest) if latest.is_submitted => Some(latest.clone()),
            Some(_) => self.repository.get_latest_submitted(scope)?,
            None => None,
        };

        let previous_version = latest_snapshot.as_ref().map(|s| s.version).unwrap_or(0);
        let is_first_sync = baseline_snapshot.is_none();
        let has_changed = match baseline_snapshot.as_ref() {
            Some(baseline) => baseline.content_hash != current_hash,
            None => true,
        };

        debug!(
            "[MenuSync] Change detection scope={} hash={} baseline={:?} latest={} changed={}",
            scope,
            current_hash,
            baseline_snapshot.as_ref().map(|s| s.version),
            previous_version,
            has_changed
        );

        Ok(ChangeDetectionResult {
            has_changed,
            current_hash,
            previous_version,
            is_first_sync,
            latest_snapshot,
            baseline_snapshot,
        })
    }

    /// Allocates `previous_version + 1` for the scope and persists the snapshot.
    ///
    /// The repository rejects the insert with a conflict when another writer
    /// claimed that version first.
    pub async fn create_snapshot(
        &self,
        scope: &SyncScope,
        catalog: &Catalog,
        content_hash: &str,
        previous_version: i64,
    ) -> Result<CatalogSnapshot> {
        let normalized = normalize(catalog)?;
        let payload = if self.store_payload {
            Some(compress_json(&normalized)?)
        } else {
            None
        };

        let snapshot = NewCatalogSnapshot {
            id: Uuid::now_v7().to_string(),
            scope: scope.clone(),
            version: previous_version.max(0) + 1,
            content_hash: content_hash.to_string(),
            counts: normalized.counts(),
            payload,
            created_at: Utc::now(),
        };

        let created = self.repository.insert_snapshot(snapshot).await?;
        debug!(
            "[MenuSync] Created snapshot scope={} version={} hash={}",
            scope, created.version, created.content_hash
        );
        Ok(created)
    }

    /// Returns the snapshot a submission of the current catalog should target.
    ///
    /// A pending snapshot from an earlier failed attempt with identical content
    /// is reused so versions never gap across retries.
    pub async fn ensure_target_snapshot(
        &self,
        scope: &SyncScope,
        catalog: &Catalog,
        change: &ChangeDetectionResult,
    ) -> Result<CatalogSnapshot> {
        if let Some(pending) = change.reusable_pending_snapshot() {
            debug!(
                "[MenuSync] Reusing pending snapshot scope={} version={}",
                scope, pending.version
            );
            return Ok(pending.clone());
        }
        self.create_snapshot(
            scope,
            catalog,
            &change.current_hash,
            change.previous_version,
        )
        .await
    }

    pub async fn mark_submitted(
        &self,
        snapshot_id: &str,
        import_id: Option<String>,
        vendor_ref: &str,
    ) -> Result<CatalogSnapshot> {
        self.repository
            .mark_submitted(
                snapshot_id.to_string(),
                import_id,
                vendor_ref.to_string(),
                Utc::now(),
            )
            .await
    }

    /// Decompresses the catalog stored with a snapshot, if any.
    pub fn load_catalog(&self, snapshot: &CatalogSnapshot) -> Result<Option<Catalog>> {
        let Some(payload) = snapshot.payload.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        let catalog: Catalog = decompress_json(payload)?;
        if content_hash(&catalog)? != snapshot.content_hash {
            return Err(Error::validation(format!(
                "Stored payload of snapshot {} does not match its content hash",
                snapshot.id
            )));
        }
        Ok(Some(catalog))
    }

    pub fn get_latest(&self, scope: &SyncScope) -> Result<Option<CatalogSnapshot>> {
        self.repository.get_latest(scope)
    }

    pub fn get_by_version(&self, scope: &SyncScope, version: i64) -> Result<Option<CatalogSnapshot>> {
        self.repository.get_by_version(scope, version)
    }

    pub fn list_versions(&self, scope: &SyncScope, limit: i64) -> Result<Vec<CatalogSnapshot>> {
        self.repository.list_versions(scope, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Product;
    use crate::memory::InMemorySnapshotRepository;
    use rust_decimal_macros::dec;

    fn catalog(names: &[(&str, &str)]) -> Catalog {
        Catalog {
            products: names
                .iter()
                .map(|(id, name)| Product {
                    id: id.to_string(),
                    name: name.to_string(),
                    description: None,
                    price: dec!(7.25),
                    category_id: None,
                    modifier_ids: vec![],
                    menu_group_ids: vec![],
                    is_active: true,
                    is_deleted: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(Arc::new(InMemorySnapshotRepository::default()))
    }

    #[tokio::test]
    async fn first_detection_is_first_sync_and_changed() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let result = detector
            .detect_changes(&scope, &catalog(&[("p1", "Burger")]))
            .unwrap();
        assert!(result.is_first_sync);
        assert!(result.has_changed);
        assert_eq!(result.previous_version, 0);
        assert!(result.latest_snapshot.is_none());
    }

    #[tokio::test]
    async fn submitted_snapshot_with_same_hash_is_unchanged() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let current = catalog(&[("p1", "Burger")]);
        let first = detector.detect_changes(&scope, &current).unwrap();
        let snapshot = detector
            .create_snapshot(&scope, &current, &first.current_hash, first.previous_version)
            .await
            .unwrap();
        assert_eq!(snapshot.version, 1);
        detector
            .mark_submitted(&snapshot.id, Some("imp-1".into()), "vendor-1")
            .await
            .unwrap();

        let second = detector.detect_changes(&scope, &current).unwrap();
        assert!(!second.has_changed);
        assert!(!second.is_first_sync);
        assert_eq!(second.previous_version, 1);
    }

    #[tokio::test]
    async fn unsubmitted_snapshot_is_not_a_baseline_and_gets_reused() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let current = catalog(&[("p1", "Burger")]);
        let first = detector.detect_changes(&scope, &current).unwrap();
        let pending = detector
            .ensure_target_snapshot(&scope, &current, &first)
            .await
            .unwrap();
        assert!(!pending.is_submitted);

        let retry = detector.detect_changes(&scope, &current).unwrap();
        assert!(retry.has_changed, "failed attempt must not mask the change");
        assert!(retry.is_first_sync);
        let target = detector
            .ensure_target_snapshot(&scope, &current, &retry)
            .await
            .unwrap();
        assert_eq!(target.id, pending.id);
        assert_eq!(target.version, 1);
    }

    #[tokio::test]
    async fn versions_increase_by_one_per_change() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let mut versions = Vec::new();
        for name in ["Burger", "Cheeseburger", "Veggie Burger"] {
            let current = catalog(&[("p1", name)]);
            let change = detector.detect_changes(&scope, &current).unwrap();
            let snapshot = detector
                .ensure_target_snapshot(&scope, &current, &change)
                .await
                .unwrap();
            detector
                .mark_submitted(&snapshot.id, None, "vendor-1")
                .await
                .unwrap();
            versions.push(snapshot.version);
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn concurrent_writer_claiming_same_version_conflicts() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let current = catalog(&[("p1", "Burger")]);
        let change = detector.detect_changes(&scope, &current).unwrap();
        detector
            .create_snapshot(&scope, &current, &change.current_hash, 0)
            .await
            .unwrap();
        let err = detector
            .create_snapshot(&scope, &current, &change.current_hash, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn stored_payload_restores_the_catalog() {
        let detector = detector();
        let scope = SyncScope::account("acc-1");
        let current = catalog(&[("p2", "Fries"), ("p1", "Burger")]);
        let change = detector.detect_changes(&scope, &current).unwrap();
        let snapshot = detector
            .create_snapshot(&scope, &current, &change.current_hash, 0)
            .await
            .unwrap();
        let restored = detector.load_catalog(&snapshot).unwrap().expect("payload");
        assert_eq!(content_hash(&restored).unwrap(), change.current_hash);
    }

    #[tokio::test]
    async fn payload_storage_can_be_disabled() {
        let detector = detector().with_payload_storage(false);
        let scope = SyncScope::account("acc-1");
        let current = catalog(&[("p1", "Burger")]);
        let change = detector.detect_changes(&scope, &current).unwrap();
        let snapshot = detector
            .create_snapshot(&scope, &current, &change.current_hash, 0)
            .await
            .unwrap();
        assert!(!snapshot.has_payload());
        assert!(detector.load_catalog(&snapshot).unwrap().is_none());
    }
}
