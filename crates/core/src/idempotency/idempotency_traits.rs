use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::scope::SyncScope;

use super::idempotency_model::{IdempotencyKind, IdempotencyRecord};

/// Versioned key/value ledger backing the idempotency guard.
#[async_trait]
pub trait IdempotencyRepositoryTrait: Send + Sync {
    fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    fn list_in_progress(
        &self,
        scope: &SyncScope,
        kind: IdempotencyKind,
    ) -> Result<Vec<IdempotencyRecord>>;

    /// Atomically writes `record` when the stored version equals
    /// `expected_version` (`None` means the key must not exist yet).
    ///
    /// Returns `false` without writing when another writer got there first.
    async fn compare_and_set(
        &self,
        record: IdempotencyRecord,
        expected_version: Option<i64>,
    ) -> Result<bool>;

    /// Removes records of the scope last updated before `cutoff`. The cutoff
    /// is far older than any lease, so in-progress rows it hits are abandoned.
    async fn purge_before(&self, scope: SyncScope, cutoff: DateTime<Utc>) -> Result<usize>;
}
