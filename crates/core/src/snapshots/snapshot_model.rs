use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogCounts;
use crate::scope::SyncScope;

/// Versioned, hashed record of a scope's catalog at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub id: String,
    pub scope: SyncScope,
    /// Strictly increasing per scope, starting at 1.
    pub version: i64,
    pub content_hash: String,
    pub counts: CatalogCounts,
    /// Gzip-compressed canonical catalog, kept for diffing and rollback.
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,
    pub is_submitted: bool,
    pub import_id: Option<String>,
    pub vendor_ref: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CatalogSnapshot {
    pub fn has_payload(&self) -> bool {
        self.payload.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Input for inserting the next snapshot version of a scope.
#[derive(Debug, Clone)]
pub struct NewCatalogSnapshot {
    pub id: String,
    pub scope: SyncScope,
    pub version: i64,
    pub content_hash: String,
    pub counts: CatalogCounts,
    pub payload: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl NewCatalogSnapshot {
    pub fn into_snapshot(self) -> CatalogSnapshot {
        CatalogSnapshot {
            id: self.id,
            scope: self.scope,
            version: self.version,
            content_hash: self.content_hash,
            counts: self.counts,
            payload: self.payload,
            is_submitted: false,
            import_id: None,
            vendor_ref: None,
            submitted_at: None,
            created_at: self.created_at,
        }
    }
}

/// Outcome of comparing the current catalog against the snapshot history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetectionResult {
    pub has_changed: bool,
    pub current_hash: String,
    /// Latest allocated version for the scope (0 when none).
    pub previous_version: i64,
    /// No snapshot has ever been submitted downstream for this scope.
    pub is_first_sync: bool,
    /// Latest snapshot of the scope, submitted or not.
    pub latest_snapshot: Option<CatalogSnapshot>,
    /// Latest submitted snapshot; the state the downstream side holds.
    pub baseline_snapshot: Option<CatalogSnapshot>,
}

impl ChangeDetectionResult {
    pub fn baseline_version(&self) -> Option<i64> {
        self.baseline_snapshot.as_ref().map(|s| s.version)
    }

    /// Unsubmitted snapshot left by an earlier failed attempt for the same content.
    pub fn reusable_pending_snapshot(&self) -> Option<&CatalogSnapshot> {
        let latest = self.latest_snapshot.as_ref()?;
        let newer_than_baseline = self
            .baseline_version()
            .map_or(true, |baseline| latest.version > baseline);
        (!latest.is_submitted && newer_than_baseline && latest.content_hash == self.current_hash)
            .then_some(latest)
    }
}
