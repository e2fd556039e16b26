use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::catalog::{Catalog, CatalogCounts, Product};
use crate::deltas::{DeletionReason, DeletionSyncStatus, DeltaPayload, DeltaSyncStatus, DeltaType};
use crate::dlq::DeadLetterPayload;
use crate::errors::{Collaborator, CollaboratorError, DatabaseError, Error, FailureType};
use crate::memory::InMemorySnapshotRepository;
use crate::runs::{RunOutcome, StepData, SyncPhase, SyncRunStatus, SyncType, TriggerSource};
use crate::scope::SyncScope;
use crate::snapshots::{CatalogSnapshot, NewCatalogSnapshot, SnapshotRepositoryTrait};

fn product(id: &str, name: &str) -> Product {
    Product {
        id: id.to_string(),
        name: name.to_string(),
        description: None,
        price: dec!(8.50),
        category_id: None,
        modifier_ids: Vec::new(),
        menu_group_ids: Vec::new(),
        is_active: true,
        is_deleted: false,
    }
}

fn catalog(products: Vec<Product>) -> Catalog {
    Catalog {
        products,
        ..Default::default()
    }
}

fn fetch_timeout() -> CollaboratorError {
    CollaboratorError::timeout(Collaborator::CatalogSource, "upstream timed out")
}

#[derive(Default)]
struct ScriptedSource {
    failures: Mutex<VecDeque<CollaboratorError>>,
    catalog: Mutex<Catalog>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn with_catalog(catalog: Catalog) -> Arc<Self> {
        let source = Self::default();
        *source.catalog.lock().unwrap() = catalog;
        Arc::new(source)
    }

    fn set_catalog(&self, catalog: Catalog) {
        *self.catalog.lock().unwrap() = catalog;
    }

    fn fail_next(&self, times: usize, error: CollaboratorError) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }
}

#[async_trait]
impl CatalogSource for ScriptedSource {
    async fn fetch_catalog(
        &self,
        _request: &CatalogFetchRequest,
    ) -> Result<Catalog, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.catalog.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingSubmitter {
    submitted: Mutex<Vec<DeltaPayload>>,
    failures: Mutex<VecDeque<CollaboratorError>>,
    item_errors: Mutex<Vec<String>>,
}

impl RecordingSubmitter {
    fn payloads(&self) -> Vec<DeltaPayload> {
        self.submitted.lock().unwrap().clone()
    }

    fn last(&self) -> DeltaPayload {
        self.payloads().pop().expect("a submitted payload")
    }
}

#[async_trait]
impl DeltaSubmitter for RecordingSubmitter {
    async fn submit_delta(
        &self,
        payload: &DeltaPayload,
        _vendor_ref: &str,
        _correlation_id: &str,
    ) -> Result<SubmissionResult, CollaboratorError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(payload.clone());
        Ok(SubmissionResult {
            success: true,
            import_id: Some(format!("import-{}", submitted.len())),
            errors: self.item_errors.lock().unwrap().clone(),
        })
    }
}

/// Parks inside `submit_delta` until released.
#[derive(Default)]
struct BlockingSubmitter {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl DeltaSubmitter for BlockingSubmitter {
    async fn submit_delta(
        &self,
        _payload: &DeltaPayload,
        _vendor_ref: &str,
        _correlation_id: &str,
    ) -> Result<SubmissionResult, CollaboratorError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(SubmissionResult::accepted("import-blocked"))
    }
}

/// Snapshot store whose writes fail on demand before reaching memory.
#[derive(Default)]
struct FlakySnapshots {
    inner: InMemorySnapshotRepository,
    insert_failures: Mutex<VecDeque<Error>>,
    mark_failures: Mutex<VecDeque<Error>>,
    /// A competing writer takes the next version just before our insert.
    race_next_insert: Mutex<bool>,
}

#[async_trait]
impl SnapshotRepositoryTrait for FlakySnapshots {
    fn get_snapshot(&self, snapshot_id: &str) -> crate::errors::Result<Option<CatalogSnapshot>> {
        self.inner.get_snapshot(snapshot_id)
    }

    fn get_latest(&self, scope: &SyncScope) -> crate::errors::Result<Option<CatalogSnapshot>> {
        self.inner.get_latest(scope)
    }

    fn get_latest_submitted(
        &self,
        scope: &SyncScope,
    ) -> crate::errors::Result<Option<CatalogSnapshot>> {
        self.inner.get_latest_submitted(scope)
    }

    fn get_by_version(
        &self,
        scope: &SyncScope,
        version: i64,
    ) -> crate::errors::Result<Option<CatalogSnapshot>> {
        self.inner.get_by_version(scope, version)
    }

    fn list_versions(
        &self,
        scope: &SyncScope,
        limit: i64,
    ) -> crate::errors::Result<Vec<CatalogSnapshot>> {
        self.inner.list_versions(scope, limit)
    }

    async fn insert_snapshot(
        &self,
        snapshot: NewCatalogSnapshot,
    ) -> crate::errors::Result<CatalogSnapshot> {
        let failure = self.insert_failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let race = std::mem::take(&mut *self.race_next_insert.lock().unwrap());
        if race {
            self.inner
                .insert_snapshot(NewCatalogSnapshot {
                    id: "competing".to_string(),
                    scope: snapshot.scope.clone(),
                    version: snapshot.version,
                    content_hash: "other-content".to_string(),
                    counts: CatalogCounts::default(),
                    payload: None,
                    created_at: Utc::now(),
                })
                .await?;
        }
        self.inner.insert_snapshot(snapshot).await
    }

    async fn mark_submitted(
        &self,
        snapshot_id: String,
        import_id: Option<String>,
        vendor_ref: String,
        submitted_at: chrono::DateTime<Utc>,
    ) -> crate::errors::Result<CatalogSnapshot> {
        let failure = self.mark_failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.inner
            .mark_submitted(snapshot_id, import_id, vendor_ref, submitted_at)
            .await
    }

    async fn prune_before(
        &self,
        scope: SyncScope,
        cutoff: chrono::DateTime<Utc>,
        keep_from_version: i64,
    ) -> crate::errors::Result<usize> {
        self.inner.prune_before(scope, cutoff, keep_from_version).await
    }
}

fn test_config() -> SyncEngineConfig {
    SyncEngineConfig {
        retry_backoff_base_ms: 1,
        ..Default::default()
    }
}

struct Harness {
    orchestrator: SyncOrchestrator,
    stores: SyncEngineStores,
    source: Arc<ScriptedSource>,
    submitter: Arc<RecordingSubmitter>,
    scope: SyncScope,
}

fn harness_with(config: SyncEngineConfig, initial: Catalog) -> Harness {
    harness_on(config, SyncEngineStores::in_memory(), initial)
}

fn harness_on(config: SyncEngineConfig, stores: SyncEngineStores, initial: Catalog) -> Harness {
    let source = ScriptedSource::with_catalog(initial);
    let submitter = Arc::new(RecordingSubmitter::default());
    let orchestrator =
        SyncOrchestrator::new(config, stores.clone(), source.clone(), submitter.clone()).unwrap();
    Harness {
        orchestrator,
        stores,
        source,
        submitter,
        scope: SyncScope::account("acc-1"),
    }
}

fn harness(initial: Catalog) -> Harness {
    harness_with(test_config(), initial)
}

fn flaky_harness(initial: Catalog) -> (Harness, Arc<FlakySnapshots>) {
    let snapshots = Arc::new(FlakySnapshots::default());
    let stores = SyncEngineStores {
        snapshots: snapshots.clone(),
        ..SyncEngineStores::in_memory()
    };
    (harness_on(test_config(), stores, initial), snapshots)
}

impl Harness {
    async fn scheduled(&self) -> SyncReport {
        self.orchestrator
            .run(
                RunSyncRequest::scheduled(self.scope.clone()),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    async fn manual(&self) -> SyncReport {
        self.orchestrator
            .run(
                RunSyncRequest::manual(self.scope.clone(), "ops@example.com"),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn first_sync_submits_every_item_as_version_one() {
    let h = harness(catalog(vec![product("P1", "Burger"), product("P2", "Fries")]));

    let report = h.scheduled().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    let run = report.run.expect("run");
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Synced));
    assert_eq!(run.counters.added, 2);

    let payload = h.submitter.last();
    assert_eq!(payload.delta_type, DeltaType::FirstSync);
    assert_eq!(payload.added.len(), 2);
    assert_eq!(payload.target_version, Some(1));

    let latest = h.orchestrator.detector().get_latest(&h.scope).unwrap().unwrap();
    assert_eq!(latest.version, 1);
    assert!(latest.is_submitted);
    assert_eq!(latest.import_id.as_deref(), Some("import-1"));

    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Completed);

    let mappings = h.orchestrator.mapper().list(&h.scope, None).unwrap();
    assert_eq!(mappings.len(), 2);
    assert!(mappings.iter().all(|m| m.last_synced_at.is_some()));

    let submission = run.submission.expect("submission info");
    assert_eq!(submission.snapshot_version, Some(1));
    assert_eq!(submission.delta_id.as_deref(), Some(deltas[0].id.as_str()));
}

#[tokio::test]
async fn rename_produces_single_update_with_changed_name() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;

    h.source.set_catalog(catalog(vec![product("P1", "Cheeseburger")]));
    let report = h.manual().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    let payload = h.submitter.last();
    assert_eq!(payload.delta_type, DeltaType::Incremental);
    assert_eq!(payload.source_version, Some(1));
    assert_eq!(payload.target_version, Some(2));
    assert_eq!(payload.total_changes(), 1);
    assert_eq!(payload.updated.len(), 1);
    assert!(payload.updated[0].changed_field_names().contains(&"name"));
}

#[tokio::test]
async fn removed_product_is_deleted_downstream_and_audited() {
    let h = harness(catalog(vec![product("P1", "Burger"), product("P2", "Fries")]));
    h.scheduled().await;

    h.source.set_catalog(catalog(vec![product("P1", "Burger")]));
    h.manual().await;

    let payload = h.submitter.last();
    assert_eq!(payload.removed.len(), 1);
    assert_eq!(payload.removed[0].source_id(), "P2");

    let deletions = h.stores.deletions.list_deletions(&h.scope, None).unwrap();
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].source_id, "P2");
    assert_eq!(deletions[0].reason, DeletionReason::RemovedFromSource);
    assert_eq!(deletions[0].sync_status, DeletionSyncStatus::Synced);

    let mapping = h
        .orchestrator
        .mapper()
        .list(&h.scope, None)
        .unwrap()
        .into_iter()
        .find(|m| m.source_id == "P2")
        .unwrap();
    assert!(!mapping.is_active);
}

#[tokio::test]
async fn unchanged_catalog_completes_without_new_version() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;

    let report = h.manual().await;

    assert_eq!(
        report.disposition,
        SyncDisposition::Skipped {
            reason: SkipReason::Unchanged
        }
    );
    let run = report.run.expect("run");
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.outcome, Some(RunOutcome::Unchanged));
    assert_eq!(h.submitter.payloads().len(), 1);
    assert_eq!(h.orchestrator.detector().list_versions(&h.scope, 10).unwrap().len(), 1);
    assert_eq!(h.orchestrator.list_deltas(&h.scope, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn scheduled_trigger_in_completed_bucket_is_skipped_without_run() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;

    let report = h.scheduled().await;

    assert!(report.run.is_none());
    assert_eq!(report.skip_reason(), Some(SkipReason::AlreadySynced));
    assert_eq!(h.orchestrator.list_runs(&h.scope, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_trigger_for_busy_scope_is_skipped() {
    let stores = SyncEngineStores::in_memory();
    let source = ScriptedSource::with_catalog(catalog(vec![product("P1", "Burger")]));
    let submitter = Arc::new(BlockingSubmitter::default());
    let orchestrator =
        SyncOrchestrator::new(test_config(), stores, source, submitter.clone()).unwrap();
    let scope = SyncScope::account("acc-1");
    let cancel = CancellationToken::new();

    let first = orchestrator.run(RunSyncRequest::scheduled(scope.clone()), &cancel);
    let second = async {
        submitter.entered.notified().await;
        let report = orchestrator
            .run(RunSyncRequest::scheduled(scope.clone()), &cancel)
            .await;
        submitter.release.notify_one();
        report
    };
    let (first, second) = tokio::join!(first, second);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.disposition, SyncDisposition::Synced);
    assert!(second.run.is_none());
    assert_eq!(second.skip_reason(), Some(SkipReason::ScopeBusy));
    assert_eq!(orchestrator.list_runs(&scope, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn transient_fetch_failures_escalate_to_dead_letter() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.source.fail_next(3, fetch_timeout());

    let report = h.scheduled().await;

    assert_eq!(
        report.disposition,
        SyncDisposition::Failed {
            failure_type: FailureType::Transient,
            retryable: true
        }
    );
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 3);

    let run = report.run.expect("run");
    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.failure_type, Some(FailureType::Transient));
    assert_eq!(run.errors.len(), 3);

    let steps = h.orchestrator.list_steps(&run.id).unwrap();
    let retries = steps
        .iter()
        .filter(|s| matches!(s.data, Some(StepData::RetryScheduled { .. })))
        .count();
    assert_eq!(retries, 2);
    assert!(steps
        .windows(2)
        .all(|pair| pair[0].sequence < pair[1].sequence));

    let entry = h
        .orchestrator
        .dead_letters()
        .get(report.dead_letter_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.failure_type, FailureType::Transient);
    assert_eq!(entry.sync_run_id.as_deref(), Some(run.id.as_str()));
    assert!(matches!(entry.payload, DeadLetterPayload::CatalogFetch { .. }));
    assert!(h.orchestrator.detector().get_latest(&h.scope).unwrap().is_none());
}

#[tokio::test]
async fn submission_timeouts_escalate_to_dead_letter() {
    let h = harness(catalog(vec![product("P1", "Burger"), product("P2", "Fries")]));
    h.scheduled().await;
    h.source.set_catalog(catalog(vec![product("P1", "Burger")]));
    for _ in 0..3 {
        h.submitter.failures.lock().unwrap().push_back(CollaboratorError::timeout(
            Collaborator::DeltaSubmission,
            "downstream timed out",
        ));
    }

    let report = h.manual().await;

    assert_eq!(
        report.disposition,
        SyncDisposition::Failed {
            failure_type: FailureType::Transient,
            retryable: true
        }
    );
    assert_eq!(h.submitter.payloads().len(), 1);
    let run = report.run.expect("run");
    assert_eq!(run.errors.len(), 3);

    let entry = h
        .orchestrator
        .dead_letters()
        .get(report.dead_letter_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(entry.failure_type, FailureType::Transient);
    assert!(matches!(
        entry.payload,
        DeadLetterPayload::DeltaSubmission {
            target_version: Some(2),
            total_changes: 1,
            ..
        }
    ));

    let pending = h.orchestrator.detector().get_latest(&h.scope).unwrap().unwrap();
    assert_eq!(pending.version, 2);
    assert!(!pending.is_submitted);
    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas[0].target_version, 2);
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Failed);
    let deletions = h
        .stores
        .deletions
        .list_deletions(&h.scope, Some(DeletionSyncStatus::Failed))
        .unwrap();
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].source_id, "P2");
}

#[tokio::test]
async fn transient_snapshot_write_is_retried_within_the_run() {
    let (h, snapshots) = flaky_harness(catalog(vec![product("P1", "Burger")]));
    snapshots
        .insert_failures
        .lock()
        .unwrap()
        .push_back(Error::Database(DatabaseError::QueryFailed(
            "database is locked".to_string(),
        )));

    let report = h.scheduled().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    assert!(report.dead_letter_id.is_none());
    assert_eq!(h.submitter.payloads().len(), 1);
    let run = report.run.unwrap();
    assert_eq!(run.warnings.len(), 1);
    let latest = h.orchestrator.detector().get_latest(&h.scope).unwrap().unwrap();
    assert_eq!(latest.version, 1);
    assert!(latest.is_submitted);
}

#[tokio::test]
async fn version_conflict_reallocates_next_version() {
    let (h, snapshots) = flaky_harness(catalog(vec![product("P1", "Burger")]));
    *snapshots.race_next_insert.lock().unwrap() = true;

    let report = h.scheduled().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    assert_eq!(h.submitter.last().target_version, Some(2));
    let versions = h.orchestrator.detector().list_versions(&h.scope, 10).unwrap();
    let numbers: Vec<i64> = versions.iter().map(|s| s.version).collect();
    assert_eq!(numbers, vec![2, 1]);
    assert!(versions[0].is_submitted);
    assert_eq!(versions[1].id, "competing");
    assert!(!versions[1].is_submitted);
}

#[tokio::test]
async fn delivered_delta_keeps_its_status_when_finalization_fails() {
    let (h, snapshots) = flaky_harness(catalog(vec![product("P1", "Burger")]));
    snapshots
        .mark_failures
        .lock()
        .unwrap()
        .push_back(Error::validation("snapshot row is read-only"));

    let report = h.scheduled().await;

    assert_eq!(
        report.disposition,
        SyncDisposition::Failed {
            failure_type: FailureType::Permanent,
            retryable: false
        }
    );
    assert_eq!(h.submitter.payloads().len(), 1);
    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Completed);
    assert!(deltas[0].completed_at.is_some());
    let latest = h.orchestrator.detector().get_latest(&h.scope).unwrap().unwrap();
    assert!(!latest.is_submitted);

    let entry = h
        .orchestrator
        .dead_letters()
        .get(report.dead_letter_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert!(matches!(
        entry.payload,
        DeadLetterPayload::Processing {
            phase: Some(SyncPhase::Finalization),
            ..
        }
    ));
}

#[tokio::test]
async fn rejected_submission_fails_permanently_and_next_run_reuses_version() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.submitter.failures.lock().unwrap().push_back(CollaboratorError::rejected(
        Collaborator::DeltaSubmission,
        "unknown vendor",
    ));

    let failed = h.scheduled().await;

    assert_eq!(
        failed.disposition,
        SyncDisposition::Failed {
            failure_type: FailureType::Permanent,
            retryable: false
        }
    );
    let entry = h
        .orchestrator
        .dead_letters()
        .get(failed.dead_letter_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempt_count, 1);
    assert!(matches!(
        entry.payload,
        DeadLetterPayload::DeltaSubmission {
            target_version: Some(1),
            ..
        }
    ));
    let pending = h.orchestrator.detector().get_latest(&h.scope).unwrap().unwrap();
    assert!(!pending.is_submitted);
    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Failed);

    let report = h.manual().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    let versions = h.orchestrator.detector().list_versions(&h.scope, 10).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].id, pending.id);
    assert!(versions[0].is_submitted);
    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].retry_count, 1);
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Completed);
}

#[tokio::test]
async fn item_errors_mark_delta_partially_failed() {
    let h = harness(catalog(vec![product("P1", "Burger"), product("P2", "Fries")]));
    h.submitter
        .item_errors
        .lock()
        .unwrap()
        .push("PRD_P2: price rejected".to_string());

    let report = h.scheduled().await;

    assert_eq!(report.disposition, SyncDisposition::Synced);
    let run = report.run.unwrap();
    assert_eq!(run.counters.failed, 1);
    assert_eq!(run.counters.succeeded, 1);
    assert_eq!(run.submission.unwrap().item_errors.len(), 1);
    let deltas = h.orchestrator.list_deltas(&h.scope, 10).unwrap();
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::PartiallyFailed);
}

#[tokio::test]
async fn versions_increase_by_one_per_submitted_change() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;
    h.source.set_catalog(catalog(vec![product("P1", "Cheeseburger")]));
    h.manual().await;
    h.source.set_catalog(catalog(vec![
        product("P1", "Cheeseburger"),
        product("P3", "Shake"),
    ]));
    h.manual().await;

    let mut versions: Vec<i64> = h
        .orchestrator
        .detector()
        .list_versions(&h.scope, 10)
        .unwrap()
        .into_iter()
        .map(|s| s.version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3]);

    let sources: Vec<Option<i64>> = h
        .submitter
        .payloads()
        .iter()
        .map(|p| p.source_version)
        .collect();
    assert_eq!(sources, vec![None, Some(1), Some(2)]);
}

#[tokio::test]
async fn cancellation_during_submission_leaves_version_unsubmitted() {
    let stores = SyncEngineStores::in_memory();
    let source = ScriptedSource::with_catalog(catalog(vec![product("P1", "Burger")]));
    let submitter = Arc::new(BlockingSubmitter::default());
    let orchestrator =
        SyncOrchestrator::new(test_config(), stores.clone(), source, submitter.clone()).unwrap();
    let scope = SyncScope::account("acc-1");
    let cancel = CancellationToken::new();

    let run = orchestrator.run(RunSyncRequest::scheduled(scope.clone()), &cancel);
    let canceller = async {
        submitter.entered.notified().await;
        cancel.cancel();
    };
    let (report, ()) = tokio::join!(run, canceller);

    let report = report.unwrap();
    assert_eq!(report.disposition, SyncDisposition::Cancelled);
    assert_eq!(report.run.unwrap().status, SyncRunStatus::Cancelled);
    let latest = orchestrator.detector().get_latest(&scope).unwrap().unwrap();
    assert!(!latest.is_submitted);
    let deltas = orchestrator.list_deltas(&scope, 10).unwrap();
    assert_eq!(deltas[0].sync_status, DeltaSyncStatus::Failed);
    assert!(orchestrator
        .dead_letters()
        .list(Some(&scope), None, 10)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancelled_token_stops_run_before_fetch() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h
        .orchestrator
        .run(RunSyncRequest::scheduled(h.scope.clone()), &cancel)
        .await
        .unwrap();

    assert_eq!(report.disposition, SyncDisposition::Cancelled);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn menu_group_without_products_completes_as_no_eligible_items() {
    let h = harness(catalog(vec![Product {
        menu_group_ids: vec!["dinner".to_string()],
        ..product("P1", "Steak")
    }]));
    let scope = SyncScope::account("acc-1").with_menu_group("lunch");

    let report = h
        .orchestrator
        .run(RunSyncRequest::scheduled(scope.clone()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.skip_reason(), Some(SkipReason::NoEligibleItems));
    let run = report.run.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::NoEligibleItems));
    assert_eq!(run.warnings.len(), 1);
    assert!(h.orchestrator.detector().get_latest(&scope).unwrap().is_none());
    assert!(h.submitter.payloads().is_empty());
}

#[tokio::test]
async fn versioning_disabled_sends_full_resync_without_history() {
    let config = SyncEngineConfig {
        versioning_enabled: false,
        ..test_config()
    };
    let h = harness_with(config, catalog(vec![product("P1", "Burger"), product("P2", "Fries")]));

    let first = h.scheduled().await;
    let second = h.manual().await;

    assert_eq!(first.disposition, SyncDisposition::Synced);
    assert_eq!(second.disposition, SyncDisposition::Synced);
    let payloads = h.submitter.payloads();
    assert_eq!(payloads.len(), 2);
    assert!(payloads
        .iter()
        .all(|p| p.delta_type == DeltaType::FullResync && p.added.len() == 2));
    assert!(h.orchestrator.detector().get_latest(&h.scope).unwrap().is_none());
    assert!(h.orchestrator.list_deltas(&h.scope, 10).unwrap().is_empty());
    assert_eq!(second.run.unwrap().submission.unwrap().snapshot_version, None);
}

#[tokio::test]
async fn retry_run_links_child_to_failed_parent_once() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.source.fail_next(3, fetch_timeout());
    let failed = h.scheduled().await.run.unwrap();

    let report = h
        .orchestrator
        .retry_run(&failed.id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.disposition, SyncDisposition::Synced);
    let child = report.run.unwrap();
    assert_eq!(child.parent_run_id.as_deref(), Some(failed.id.as_str()));
    assert_eq!(child.retry_count, 1);
    assert_eq!(child.trigger_source, TriggerSource::Retry);
    assert_eq!(child.correlation_id, failed.correlation_id);

    let again = h
        .orchestrator
        .retry_run(&failed.id, &CancellationToken::new())
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
    let completed = h
        .orchestrator
        .retry_run(&child.id, &CancellationToken::new())
        .await;
    assert!(matches!(completed, Err(Error::Validation(_))));
}

#[tokio::test]
async fn retry_of_forced_run_stays_full() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;
    h.source.fail_next(3, fetch_timeout());
    let failed = h
        .orchestrator
        .run(
            RunSyncRequest::manual(h.scope.clone(), "ops").with_force_full(true),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .run
        .unwrap();
    assert_eq!(failed.sync_type, SyncType::Full);

    let child = h
        .orchestrator
        .retry_run(&failed.id, &CancellationToken::new())
        .await
        .unwrap()
        .run
        .unwrap();

    assert_eq!(child.sync_type, SyncType::Full);
    assert_eq!(h.submitter.last().delta_type, DeltaType::FullResync);
}

#[tokio::test]
async fn dead_letter_replay_reruns_scope_and_stamps_entry() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.source.fail_next(3, fetch_timeout());
    let failed = h.scheduled().await;
    let entry_id = failed.dead_letter_id.unwrap();

    let reports = h
        .orchestrator
        .replay_dead_letters(10, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].disposition, SyncDisposition::Synced);
    assert_eq!(reports[0].correlation_id, failed.correlation_id);
    let replay_run = reports[0].run.as_ref().unwrap();
    assert_eq!(replay_run.trigger_source, TriggerSource::DeadLetterReplay);

    let entry = h.orchestrator.dead_letters().get(&entry_id).unwrap().unwrap();
    assert_eq!(entry.replayed_by_run_id.as_deref(), Some(replay_run.id.as_str()));

    let second_sweep = h
        .orchestrator
        .replay_dead_letters(10, &CancellationToken::new())
        .await
        .unwrap();
    assert!(second_sweep.is_empty());
}

#[tokio::test]
async fn permanent_dead_letters_are_not_replayed() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.submitter.failures.lock().unwrap().push_back(CollaboratorError::rejected(
        Collaborator::DeltaSubmission,
        "bad payload",
    ));
    h.scheduled().await;

    let reports = h
        .orchestrator
        .replay_dead_letters(10, &CancellationToken::new())
        .await
        .unwrap();

    assert!(reports.is_empty());
}

#[tokio::test]
async fn batch_runs_every_scope() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    let requests = ["acc-1", "acc-2", "acc-3"]
        .into_iter()
        .map(|account| RunSyncRequest::scheduled(SyncScope::account(account)))
        .collect();

    let results = h
        .orchestrator
        .run_batch(requests, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    for result in &results {
        let report = result.result.as_ref().unwrap();
        assert_eq!(report.disposition, SyncDisposition::Synced);
        assert_eq!(report.scope, result.scope);
    }
    assert_eq!(h.submitter.payloads().len(), 3);
}

#[tokio::test]
async fn invalid_scope_is_rejected_before_any_run() {
    let h = harness(catalog(vec![product("P1", "Burger")]));

    let result = h
        .orchestrator
        .run(
            RunSyncRequest::scheduled(SyncScope::account("  ")),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn statistics_separate_skips_from_successes_and_failures() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;
    h.manual().await;
    h.source.fail_next(3, fetch_timeout());
    h.manual().await;

    let stats = h
        .orchestrator
        .run_statistics(&h.scope, Utc::now() - Duration::hours(1))
        .unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.transient_failures, 1);
    assert!(stats.last_success_at.is_some());
}

#[tokio::test]
async fn maintenance_keeps_recent_history_and_baseline() {
    let h = harness(catalog(vec![product("P1", "Burger")]));
    h.scheduled().await;
    h.source.set_catalog(catalog(vec![product("P1", "Cheeseburger")]));
    h.manual().await;

    let report = h.orchestrator.run_maintenance(&h.scope).await.unwrap();

    assert_eq!(report.snapshots_pruned, 0);
    assert_eq!(report.deltas_pruned, 0);
    assert_eq!(report.runs_pruned, 0);
    assert!(report.mappings.is_clean());
    let baseline = h
        .stores
        .snapshots
        .get_latest_submitted(&h.scope)
        .unwrap()
        .unwrap();
    assert_eq!(baseline.version, 2);
}

#[tokio::test]
async fn trigger_surface_runs_scheduled_sync() {
    let h = harness(catalog(vec![product("P1", "Burger")]));

    let report = h
        .orchestrator
        .run_sync("acc-1", Some("branch-1"), None, false)
        .await
        .unwrap();

    assert_eq!(report.disposition, SyncDisposition::Synced);
    assert_eq!(report.scope.branch_id.as_deref(), Some("branch-1"));
    assert_eq!(report.run.unwrap().trigger_source, TriggerSource::Scheduled);
}
