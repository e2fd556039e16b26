//! Sync run orchestrator: one tracked, retryable attempt per trigger.
//!
//! Flow of a run: job lock, catalog fetch, change detection, content lock,
//! delta generation, deletion audit, submission, finalization. Every exit
//! path releases the locks it holds, including panics inside the run.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{compress_json, content_hash, Catalog};
use crate::deltas::{
    deletion_records, DeletionRepositoryTrait, DeletionSyncStatus, Delta, DeltaEntry,
    DeltaGenerator, DeltaPayload, DeltaRepositoryTrait, DeltaSyncStatus, DeltaType,
};
use crate::dlq::{DeadLetterPayload, DeadLetterQueue, DeadLetterRepositoryTrait, NewDeadLetter};
use crate::errors::{Collaborator, CollaboratorError, Error, FailureType, Result};
use crate::idempotency::{
    content_key, job_key, ClaimPolicy, IdempotencyGuard, IdempotencyKind, IdempotencyLease,
    IdempotencyRepositoryTrait,
};
use crate::mappings::{MappingKey, MappingRepositoryTrait, StableIdMapper};
use crate::memory::{
    InMemoryDeadLetterRepository, InMemoryDeletionRepository, InMemoryDeltaRepository,
    InMemoryIdempotencyRepository, InMemoryMappingRepository, InMemorySnapshotRepository,
    InMemorySyncRunRepository,
};
use crate::runs::{
    NewSyncRun, RunOutcome, RunStatistics, StepData, SubmissionInfo, SyncPhase, SyncRun,
    SyncRunRepositoryTrait, SyncRunStatus, SyncRunStep, SyncType, TriggerSource,
};
use crate::scope::SyncScope;
use crate::snapshots::{
    CatalogSnapshot, ChangeDetectionResult, ChangeDetector, SnapshotRepositoryTrait,
};

use super::collaborators::{CatalogFetchRequest, CatalogSource, DeltaSubmitter, SubmissionResult};
use super::config::SyncEngineConfig;
use super::retry::RetryPolicy;
use super::sync_model::{
    BatchResult, MaintenanceReport, RunSyncRequest, SkipReason, SyncDisposition, SyncReport,
};

/// Repositories the engine persists through.
#[derive(Clone)]
pub struct SyncEngineStores {
    pub snapshots: Arc<dyn SnapshotRepositoryTrait>,
    pub mappings: Arc<dyn MappingRepositoryTrait>,
    pub deltas: Arc<dyn DeltaRepositoryTrait>,
    pub deletions: Arc<dyn DeletionRepositoryTrait>,
    pub runs: Arc<dyn SyncRunRepositoryTrait>,
    pub idempotency: Arc<dyn IdempotencyRepositoryTrait>,
    pub dead_letters: Arc<dyn DeadLetterRepositoryTrait>,
}

impl SyncEngineStores {
    pub fn in_memory() -> Self {
        Self {
            snapshots: Arc::new(InMemorySnapshotRepository::default()),
            mappings: Arc::new(InMemoryMappingRepository::default()),
            deltas: Arc::new(InMemoryDeltaRepository::default()),
            deletions: Arc::new(InMemoryDeletionRepository::default()),
            runs: Arc::new(InMemorySyncRunRepository::default()),
            idempotency: Arc::new(InMemoryIdempotencyRepository::default()),
            dead_letters: Arc::new(InMemoryDeadLetterRepository::default()),
        }
    }
}

/// What was generated for submission, kept for dead-letter payloads.
#[derive(Debug, Clone, Copy)]
struct PayloadSummary {
    delta_type: DeltaType,
    target_version: Option<i64>,
    total_changes: i64,
}

/// Mutable state of one executing run.
struct RunContext {
    run: SyncRun,
    steps: Vec<SyncRunStep>,
    request: RunSyncRequest,
    job_lease: IdempotencyLease,
    content_lease: Option<IdempotencyLease>,
    /// Attempts spent on the operation of the current phase.
    attempts: i32,
    delta: Option<Delta>,
    payload: Option<PayloadSummary>,
    /// Downstream accepted the submission; the delta must not be downgraded.
    delivered: bool,
}

impl RunContext {
    fn record(&mut self, step: SyncRunStep) {
        self.steps.push(step);
    }

    fn scope(&self) -> SyncScope {
        self.run.scope.clone()
    }

    /// Shortest stale window among the held leases.
    fn lease_window(&self) -> StdDuration {
        let window = match self.content_lease.as_ref() {
            Some(content) => self.job_lease.stale_after.min(content.stale_after),
            None => self.job_lease.stale_after,
        };
        window.to_std().unwrap_or(StdDuration::ZERO)
    }

    fn leases(&self) -> impl Iterator<Item = &IdempotencyLease> {
        std::iter::once(&self.job_lease).chain(self.content_lease.as_ref())
    }

    fn failed_operation(&self) -> DeadLetterPayload {
        let force_full = self.request.force_full;
        match (self.run.current_phase, self.payload) {
            (Some(SyncPhase::DataFetch), _) => DeadLetterPayload::CatalogFetch { force_full },
            (Some(SyncPhase::Submission), Some(summary)) => DeadLetterPayload::DeltaSubmission {
                force_full,
                delta_id: self.delta.as_ref().map(|d| d.id.clone()),
                delta_type: summary.delta_type,
                target_version: summary.target_version,
                total_changes: summary.total_changes,
            },
            (phase, _) => DeadLetterPayload::Processing { force_full, phase },
        }
    }
}

fn cancelled() -> Error {
    Error::Cancelled("Sync run cancelled".to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Composes the engine services into tracked sync runs.
pub struct SyncOrchestrator {
    config: SyncEngineConfig,
    source: Arc<dyn CatalogSource>,
    submitter: Arc<dyn DeltaSubmitter>,
    detector: ChangeDetector,
    mapper: StableIdMapper,
    generator: DeltaGenerator,
    guard: IdempotencyGuard,
    dlq: DeadLetterQueue,
    deltas: Arc<dyn DeltaRepositoryTrait>,
    deletions: Arc<dyn DeletionRepositoryTrait>,
    runs: Arc<dyn SyncRunRepositoryTrait>,
    worker_id: String,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncEngineConfig,
        stores: SyncEngineStores,
        source: Arc<dyn CatalogSource>,
        submitter: Arc<dyn DeltaSubmitter>,
    ) -> Result<Self> {
        config.validate()?;
        let detector = ChangeDetector::new(stores.snapshots)
            .with_payload_storage(config.store_catalog_payload);
        let mapper = StableIdMapper::new(stores.mappings)
            .with_menu_group_partitioning(config.partition_remote_codes_by_menu_group);
        let generator = DeltaGenerator::new(detector.clone(), mapper.clone());

        Ok(Self {
            config,
            source,
            submitter,
            detector,
            mapper,
            generator,
            guard: IdempotencyGuard::new(stores.idempotency),
            dlq: DeadLetterQueue::new(stores.dead_letters),
            deltas: stores.deltas,
            deletions: stores.deletions,
            runs: stores.runs,
            worker_id: format!("worker-{}", Uuid::now_v7()),
        })
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn mapper(&self) -> &StableIdMapper {
        &self.mapper
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        self.runs.get_run(run_id)
    }

    pub fn list_runs(&self, scope: &SyncScope, limit: i64) -> Result<Vec<SyncRun>> {
        self.runs.list_runs(scope, limit)
    }

    pub fn list_steps(&self, run_id: &str) -> Result<Vec<SyncRunStep>> {
        self.runs.list_steps(run_id)
    }

    pub fn list_deltas(&self, scope: &SyncScope, limit: i64) -> Result<Vec<Delta>> {
        self.deltas.list_deltas(scope, limit)
    }

    /// Executes one trigger for a scope.
    ///
    /// Returns `Err` only when the trigger could not be recorded at all
    /// (invalid scope, persistence failure before the run exists). Run
    /// failures are reported through the returned [`SyncReport`].
    pub async fn run(&self, request: RunSyncRequest, cancel: &CancellationToken) -> Result<SyncReport> {
        request.scope.validate()?;
        let scope = request.scope.clone();
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let run_id = Uuid::now_v7().to_string();
        let owner_id = format!("{}:{}", self.worker_id, run_id);

        let key = job_key(&scope, Utc::now(), self.config.job_bucket_secs);
        let policy = ClaimPolicy::new(self.config.job_lock_stale_after()).allowing_rerun(
            request.trigger_source.reruns_completed_bucket() || request.force_full,
        );
        let claim = self
            .guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, &key, &owner_id, policy)
            .await?;
        let decision = claim.decision;
        let Some(job_lease) = claim.lease.filter(|_| decision.can_proceed()) else {
            info!(
                "[MenuSync] Skipping {} trigger for scope={} correlation={}: {:?}",
                request.trigger_source.as_str(),
                scope,
                correlation_id,
                decision
            );
            return Ok(SyncReport {
                scope,
                correlation_id,
                disposition: SyncDisposition::Skipped {
                    reason: SkipReason::from_refused_claim(decision),
                },
                run: None,
                dead_letter_id: None,
            });
        };

        let run = match self
            .create_run(&request, run_id, correlation_id.clone())
            .await
        {
            Ok(run) => run,
            Err(err) => {
                self.release(&job_lease, Some(&err.summary())).await;
                return Err(err);
            }
        };
        info!(
            "[MenuSync] Run {} started for scope={} correlation={} trigger={}",
            run.id,
            scope,
            correlation_id,
            request.trigger_source.as_str()
        );

        let mut ctx = RunContext {
            run,
            steps: Vec::new(),
            request,
            job_lease,
            content_lease: None,
            attempts: 0,
            delta: None,
            payload: None,
            delivered: false,
        };

        let result = AssertUnwindSafe(self.execute(&mut ctx, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::internal(format!(
                    "Sync run panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match result {
            Ok(outcome) => self.finish_completed(ctx, outcome).await,
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                self.finish_cancelled(ctx, err).await
            }
            Err(err) => self.finish_failed(ctx, err).await,
        }
    }

    /// Starts the next run of a failed run's retry chain.
    pub async fn retry_run(&self, failed_run_id: &str, cancel: &CancellationToken) -> Result<SyncReport> {
        let parent = self
            .runs
            .get_run(failed_run_id)?
            .ok_or_else(|| Error::not_found(format!("sync run {}", failed_run_id)))?;
        if parent.status != SyncRunStatus::Failed {
            return Err(Error::validation(format!(
                "Run {} is {}, only failed runs can be retried",
                parent.id, parent.status
            )));
        }
        if !parent.can_retry {
            return Err(Error::validation(format!(
                "Run {} cannot be retried (retry {} of {}, failure {:?})",
                parent.id, parent.retry_count, self.config.max_run_retries, parent.failure_type
            )));
        }
        if let Some(child) = self.runs.find_retry_of(&parent.id)? {
            return Err(Error::Conflict(format!(
                "Run {} was already retried by run {}",
                parent.id, child.id
            )));
        }

        let request = RunSyncRequest {
            scope: parent.scope.clone(),
            force_full: parent.sync_type == SyncType::Full,
            trigger_source: TriggerSource::Retry,
            initiated_by: parent.initiated_by.clone(),
            parent_run_id: Some(parent.id.clone()),
            correlation_id: Some(parent.correlation_id.clone()),
            prior_attempts: 0,
        };
        self.run(request, cancel).await
    }

    /// Automated sweep re-invoking the engine for transient dead letters.
    ///
    /// An entry is stamped with the replaying run. Entries whose trigger was
    /// refused by the job lock stay eligible for the next sweep.
    pub async fn replay_dead_letters(
        &self,
        max_entries: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncReport>> {
        let candidates = self
            .dlq
            .replay_candidates(self.config.dlq_max_attempts, max_entries)?;
        let mut reports = Vec::with_capacity(candidates.len());

        for entry in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let request = RunSyncRequest {
                scope: entry.scope.clone(),
                force_full: entry.payload.force_full(),
                trigger_source: TriggerSource::DeadLetterReplay,
                initiated_by: Some(format!("dlq:{}", entry.id)),
                parent_run_id: None,
                correlation_id: Some(entry.correlation_id.clone()),
                prior_attempts: entry.attempt_count,
            };
            let report = self.run(request, cancel).await?;
            match report.run.as_ref() {
                Some(run) => {
                    if !self.dlq.mark_replayed(&entry.id, &run.id).await? {
                        warn!(
                            "[MenuSync] Dead letter {} was already replayed by another sweep",
                            entry.id
                        );
                    }
                }
                None => debug!(
                    "[MenuSync] Replay of dead letter {} deferred: {:?}",
                    entry.id,
                    report.skip_reason()
                ),
            }
            reports.push(report);
        }

        Ok(reports)
    }

    /// Runs many scopes concurrently, at most `maxConcurrentScopes` at a time.
    /// Results come back in completion order.
    pub async fn run_batch(
        &self,
        requests: Vec<RunSyncRequest>,
        cancel: &CancellationToken,
    ) -> Vec<BatchResult> {
        futures::stream::iter(requests)
            .map(move |request| async move {
                let scope = request.scope.clone();
                let result = self.run(request, cancel).await;
                BatchResult { scope, result }
            })
            .buffer_unordered(self.config.max_concurrent_scopes)
            .collect()
            .await
    }

    pub fn run_statistics(&self, scope: &SyncScope, since: DateTime<Utc>) -> Result<RunStatistics> {
        let runs = self.runs.list_runs_since(scope, since)?;
        Ok(RunStatistics::from_runs(&runs))
    }

    /// Retention sweep for one scope. The latest submitted snapshot is never pruned.
    pub async fn run_maintenance(&self, scope: &SyncScope) -> Result<MaintenanceReport> {
        scope.validate()?;
        let now = Utc::now();
        let days = |n: i64| now - Duration::days(n);

        let snapshots = self.detector.repository();
        let keep_from_version = match snapshots.get_latest_submitted(scope)? {
            Some(baseline) => baseline.version,
            None => snapshots.get_latest(scope)?.map_or(i64::MAX, |s| s.version),
        };

        let report = MaintenanceReport {
            snapshots_pruned: snapshots
                .prune_before(
                    scope.clone(),
                    days(self.config.snapshot_retention_days),
                    keep_from_version,
                )
                .await?,
            deltas_pruned: self
                .deltas
                .prune_before(scope.clone(), days(self.config.delta_retention_days))
                .await?,
            runs_pruned: self
                .runs
                .prune_before(scope.clone(), days(self.config.run_retention_days))
                .await?,
            deletions_purged: self.deletions.purge_expired(scope.clone(), now).await?,
            idempotency_records_purged: self
                .guard
                .purge_before(scope, days(self.config.idempotency_retention_days))
                .await?,
            mappings: self.mapper.validate_and_fix(scope).await?,
        };

        info!(
            "[MenuSync] Maintenance for scope={}: snapshots={} deltas={} runs={} deletions={} locks={} mapping_fixes={}",
            scope,
            report.snapshots_pruned,
            report.deltas_pruned,
            report.runs_pruned,
            report.deletions_purged,
            report.idempotency_records_purged,
            !report.mappings.is_clean()
        );
        Ok(report)
    }

    async fn create_run(
        &self,
        request: &RunSyncRequest,
        run_id: String,
        correlation_id: String,
    ) -> Result<SyncRun> {
        let parent = match request.parent_run_id.as_deref() {
            Some(parent_id) => Some(
                self.runs
                    .get_run(parent_id)?
                    .ok_or_else(|| Error::not_found(format!("sync run {}", parent_id)))?,
            ),
            None => None,
        };
        let (run, created) = SyncRun::new(
            NewSyncRun {
                id: run_id,
                correlation_id,
                scope: request.scope.clone(),
                sync_type: if request.force_full {
                    SyncType::Full
                } else {
                    SyncType::Incremental
                },
                trigger_source: request.trigger_source,
                initiated_by: request.initiated_by.clone(),
                max_retries: self.config.max_run_retries,
            },
            parent.as_ref(),
        );
        self.runs.insert_run(run, vec![created]).await
    }

    async fn execute(&self, ctx: &mut RunContext, cancel: &CancellationToken) -> Result<RunOutcome> {
        let step = ctx.run.start()?;
        ctx.record(step);
        let scope = ctx.scope();

        self.checkpoint(ctx, SyncPhase::DataFetch, cancel).await?;
        let fetched = self.fetch_catalog(ctx, cancel).await?;
        let source_products = fetched.products.len() as i64;
        let catalog = match scope.menu_group_id.as_deref() {
            Some(group) => fetched.filter_for_menu_group(group),
            None => fetched,
        };
        let counts = catalog.counts();
        let step = ctx.run.note(
            format!(
                "Fetched {} products, {} eligible",
                source_products, counts.products
            ),
            Some(StepData::CatalogFetched {
                products: source_products,
                categories: counts.categories,
                modifiers: counts.modifiers,
                eligible_products: counts.products,
            }),
        );
        ctx.record(step);

        if source_products > 0 && counts.products == 0 {
            let message = format!(
                "Menu group {} excludes every product of the scope",
                scope.menu_group_id.as_deref().unwrap_or_default()
            );
            warn!("[MenuSync] {} (scope={})", message, scope);
            let step = ctx.run.add_warning(message);
            ctx.record(step);
            return Ok(RunOutcome::NoEligibleItems);
        }

        if !self.config.versioning_enabled {
            return self.execute_unversioned(ctx, &catalog, cancel).await;
        }

        self.checkpoint(ctx, SyncPhase::ChangeDetection, cancel).await?;
        let change = self.detector.detect_changes(&scope, &catalog)?;
        let step = ctx.run.note(
            if change.has_changed {
                "Catalog changed since the last submission"
            } else {
                "Catalog unchanged since the last submission"
            },
            Some(StepData::ChangeDetected {
                has_changed: change.has_changed,
                current_hash: change.current_hash.clone(),
                previous_version: change.previous_version,
                is_first_sync: change.is_first_sync,
            }),
        );
        ctx.record(step);

        let force_full = ctx.request.force_full;
        if !change.has_changed && !force_full {
            info!(
                "[MenuSync] Catalog unchanged for scope={} (baseline v{})",
                scope,
                change.baseline_version().unwrap_or(0)
            );
            return Ok(RunOutcome::Unchanged);
        }

        if !self.claim_content(ctx, &change).await? {
            return Ok(RunOutcome::DuplicateContent);
        }

        self.checkpoint(ctx, SyncPhase::DeltaGeneration, cancel).await?;
        let (change, target) = self.allocate_target(ctx, &catalog, change).await?;
        let payload = self
            .generator
            .generate_delta(&scope, &catalog, &change, Some(target.version), force_full)
            .await?;
        self.record_payload(ctx, &payload);

        let vendor_ref = self.submitter.vendor_ref(&scope);
        if payload.is_empty() {
            self.mark_target_submitted(ctx, &target, None, &vendor_ref)
                .await?;
            let step = ctx.run.note(
                format!(
                    "No tracked field changed, baseline advanced to v{}",
                    target.version
                ),
                None,
            );
            ctx.record(step);
            return Ok(RunOutcome::NoTrackedChanges);
        }

        let delta = self.persist_delta(ctx, &change, &target, &payload).await?;
        ctx.delta = Some(delta);

        self.checkpoint(ctx, SyncPhase::SoftDeleteProcessing, cancel)
            .await?;
        let deletion_ids = self.record_deletions(ctx, &payload).await?;

        self.checkpoint(ctx, SyncPhase::Submission, cancel).await?;
        self.update_delta_status(ctx, DeltaSyncStatus::InProgress, None)
            .await?;
        let result = self.submit(ctx, &payload, &vendor_ref, cancel).await?;
        let attempts = ctx.attempts;
        ctx.delivered = true;

        // Downstream accepted the delta; cancellation is no longer honoured.
        let (status, item_error) = if result.errors.is_empty() {
            (DeltaSyncStatus::Completed, None)
        } else {
            (
                DeltaSyncStatus::PartiallyFailed,
                Some(result.errors.join("; ")),
            )
        };
        self.update_delta_status(ctx, status, item_error).await?;
        self.enter_phase(ctx, SyncPhase::Finalization).await?;
        if !deletion_ids.is_empty() {
            let (deletions, ids) = (&self.deletions, &deletion_ids);
            self.with_store_retry(ctx, "Deletion status update", move |_| {
                deletions.update_status(ids.clone(), DeletionSyncStatus::Synced, None, Utc::now())
            })
            .await?;
        }
        self.mark_target_submitted(ctx, &target, result.import_id.clone(), &vendor_ref)
            .await?;
        self.finalize_mappings(ctx, &catalog, &payload).await?;
        self.record_submission(ctx, &payload, &result, vendor_ref, Some(target.version), attempts);

        self.enter_phase(ctx, SyncPhase::Cleanup).await?;
        Ok(RunOutcome::Synced)
    }

    /// Versioning off: full resync of the current catalog, no snapshot or delta rows.
    async fn execute_unversioned(
        &self,
        ctx: &mut RunContext,
        catalog: &Catalog,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let scope = ctx.scope();
        self.checkpoint(ctx, SyncPhase::DeltaGeneration, cancel).await?;
        let payload = self
            .generator
            .full_resync(&scope, catalog, content_hash(catalog)?)
            .await?;
        self.record_payload(ctx, &payload);

        let vendor_ref = self.submitter.vendor_ref(&scope);
        self.checkpoint(ctx, SyncPhase::Submission, cancel).await?;
        let result = self.submit(ctx, &payload, &vendor_ref, cancel).await?;
        let attempts = ctx.attempts;

        self.enter_phase(ctx, SyncPhase::Finalization).await?;
        self.finalize_mappings(ctx, catalog, &payload).await?;
        self.record_submission(ctx, &payload, &result, vendor_ref, None, attempts);

        self.enter_phase(ctx, SyncPhase::Cleanup).await?;
        Ok(RunOutcome::Synced)
    }

    async fn fetch_catalog(&self, ctx: &mut RunContext, cancel: &CancellationToken) -> Result<Catalog> {
        let request = CatalogFetchRequest::complete(ctx.scope());
        let (source, request) = (&self.source, &request);
        self.with_retry(ctx, cancel, &self.config.fetch_retry_policy(), move || async move {
            source.fetch_catalog(request).await.map_err(Error::from)
        })
        .await
    }

    async fn submit(
        &self,
        ctx: &mut RunContext,
        payload: &DeltaPayload,
        vendor_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult> {
        let correlation_id = ctx.run.correlation_id.clone();
        let (submitter, correlation_id) = (&self.submitter, correlation_id.as_str());
        let policy = self.config.submission_retry_policy();

        let result = self
            .with_retry(ctx, cancel, &policy, move || async move {
                let result = submitter
                    .submit_delta(payload, vendor_ref, correlation_id)
                    .await?;
                if !result.success {
                    let reason = if result.errors.is_empty() {
                        "submission rejected".to_string()
                    } else {
                        result.errors.join("; ")
                    };
                    return Err(
                        CollaboratorError::rejected(Collaborator::DeltaSubmission, reason).into(),
                    );
                }
                Ok(result)
            })
            .await?;

        let step = ctx.run.note(
            format!(
                "Submitted {} changes as {}",
                payload.total_changes(),
                result.import_id.as_deref().unwrap_or("(no import id)")
            ),
            Some(StepData::Submitted {
                import_id: result.import_id.clone(),
                attempts: ctx.attempts,
                item_errors: result.errors.len() as i64,
            }),
        );
        ctx.record(step);
        Ok(result)
    }

    /// Calls `call` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// Leases are renewed before every retry. A backoff longer than the
    /// shortest lease window ends the loop with the last error.
    async fn with_retry<T, F, Fut>(
        &self,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            ctx.attempts = attempt as i32;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                outcome = call() => outcome,
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.is_cancelled()
                || err.failure_type() == FailureType::Permanent
                || !policy.allows_another_attempt(attempt)
            {
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            if delay >= ctx.lease_window() {
                let step = ctx.run.add_warning(format!(
                    "Backoff of {} ms exceeds the lock lease, escalating",
                    delay.as_millis()
                ));
                ctx.record(step);
                return Err(err);
            }

            warn!(
                "[MenuSync] Attempt {} of run {} failed ({}), retrying in {} ms",
                attempt,
                ctx.run.id,
                err,
                delay.as_millis()
            );
            let step = ctx.run.record_error(&err, attempt as i32);
            ctx.record(step);
            let step = ctx
                .run
                .note_retry(attempt as i32 + 1, delay.as_millis() as i64, err.code());
            ctx.record(step);
            self.flush(ctx).await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            self.renew_leases(ctx).await?;
        }
    }

    /// Retries a store write that failed transiently.
    ///
    /// `call` receives the attempt number. Cancellation is not honoured here
    /// and the phase attempt counter is left alone. A backoff longer than the
    /// shortest lease window ends the loop with the last error.
    async fn with_store_retry<T, F, Fut>(
        &self,
        ctx: &mut RunContext,
        operation: &str,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.config.persistence_retry_policy();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if err.failure_type() == FailureType::Permanent
                || !policy.allows_another_attempt(attempt)
            {
                return Err(err);
            }
            let delay = policy.delay_for(attempt);
            if delay >= ctx.lease_window() {
                return Err(err);
            }

            warn!(
                "[MenuSync] {} for run {} failed ({}), retrying in {} ms",
                operation,
                ctx.run.id,
                err,
                delay.as_millis()
            );
            let step = ctx.run.add_warning(format!(
                "{} failed on attempt {} ({}), retrying",
                operation,
                attempt,
                err.summary()
            ));
            ctx.record(step);
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot the submission targets.
    ///
    /// After a version conflict the change is detected again, so the retry
    /// allocates its version from the new latest snapshot.
    async fn allocate_target(
        &self,
        ctx: &mut RunContext,
        catalog: &Catalog,
        change: ChangeDetectionResult,
    ) -> Result<(ChangeDetectionResult, CatalogSnapshot)> {
        let scope = ctx.scope();
        let (detector, scope, initial) = (&self.detector, &scope, &change);
        self.with_store_retry(ctx, "Snapshot allocation", move |attempt| async move {
            let change = if attempt == 1 {
                initial.clone()
            } else {
                detector.detect_changes(scope, catalog)?
            };
            let target = detector
                .ensure_target_snapshot(scope, catalog, &change)
                .await?;
            Ok::<_, Error>((change, target))
        })
        .await
    }

    async fn mark_target_submitted(
        &self,
        ctx: &mut RunContext,
        target: &CatalogSnapshot,
        import_id: Option<String>,
        vendor_ref: &str,
    ) -> Result<CatalogSnapshot> {
        let (detector, import_id) = (&self.detector, &import_id);
        self.with_store_retry(ctx, "Snapshot submission mark", move |_| {
            detector.mark_submitted(&target.id, import_id.clone(), vendor_ref)
        })
        .await
    }

    /// Returns `false` when the content was already handled by another run.
    async fn claim_content(&self, ctx: &mut RunContext, change: &ChangeDetectionResult) -> Result<bool> {
        let scope = ctx.scope();
        let key = content_key(
            &scope,
            change.baseline_version(),
            &change.current_hash,
            ctx.request.force_full,
        );
        let owner_id = ctx.job_lease.owner_id.clone();
        let claim = self
            .guard
            .check_and_mark_started(
                &scope,
                IdempotencyKind::Content,
                &key,
                &owner_id,
                ClaimPolicy::new(self.config.content_lock_stale_after()),
            )
            .await?;

        match claim.lease {
            Some(lease) if claim.decision.can_proceed() => {
                ctx.content_lease = Some(lease);
                Ok(true)
            }
            _ => {
                info!(
                    "[MenuSync] Content {} for scope={} already handled: {:?}",
                    change.current_hash, scope, claim.decision
                );
                let step = ctx
                    .run
                    .add_warning(format!("Content already handled ({:?})", claim.decision));
                ctx.record(step);
                Ok(false)
            }
        }
    }

    fn record_payload(&self, ctx: &mut RunContext, payload: &DeltaPayload) {
        ctx.payload = Some(PayloadSummary {
            delta_type: payload.delta_type,
            target_version: payload.target_version,
            total_changes: payload.total_changes(),
        });
        let counters = &mut ctx.run.counters;
        counters.processed = payload.total_changes() + payload.referenced.len() as i64;
        counters.skipped = payload.referenced.len() as i64;
        counters.added = payload.added.len() as i64;
        counters.updated = payload.updated.len() as i64;
        counters.deleted = (payload.removed.len() + payload.soft_deleted.len()) as i64;

        let step = ctx.run.note(
            format!(
                "Generated {} delta with {} changes",
                payload.delta_type.as_str(),
                payload.total_changes()
            ),
            Some(StepData::DeltaGenerated {
                delta_type: payload.delta_type,
                target_version: payload.target_version,
                added: payload.added.len() as i64,
                updated: payload.updated.len() as i64,
                removed: payload.removed.len() as i64,
                soft_deleted: payload.soft_deleted.len() as i64,
                referenced: payload.referenced.len() as i64,
            }),
        );
        ctx.record(step);
    }

    fn record_submission(
        &self,
        ctx: &mut RunContext,
        payload: &DeltaPayload,
        result: &SubmissionResult,
        vendor_ref: String,
        snapshot_version: Option<i64>,
        attempts: i32,
    ) {
        let item_errors = result.errors.len() as i64;
        ctx.run.counters.failed = item_errors;
        ctx.run.counters.succeeded = (payload.total_changes() - item_errors).max(0);
        ctx.run.submission = Some(SubmissionInfo {
            vendor_ref,
            import_id: result.import_id.clone(),
            delta_id: ctx.delta.as_ref().map(|d| d.id.clone()),
            snapshot_version,
            attempts,
            item_errors: result.errors.clone(),
            submitted_at: Some(Utc::now()),
        });
    }

    /// Stores the delta targeting `target`, reusing the row a failed attempt left.
    async fn persist_delta(
        &self,
        ctx: &mut RunContext,
        change: &ChangeDetectionResult,
        target: &CatalogSnapshot,
        payload: &DeltaPayload,
    ) -> Result<Delta> {
        let now = Utc::now();
        let compressed = compress_json(payload)?;
        let source_snapshot_id = match payload.delta_type {
            DeltaType::FirstSync => None,
            _ => change.baseline_snapshot.as_ref().map(|s| s.id.clone()),
        };

        if let Some(mut existing) = self.deltas.get_for_target(&target.id)? {
            if !existing.sync_status.is_delivered() {
                existing.delta_type = payload.delta_type;
                existing.source_snapshot_id = source_snapshot_id;
                existing.source_version = payload.source_version;
                existing.added_count = payload.added.len() as i64;
                existing.updated_count = payload.updated.len() as i64;
                existing.removed_count = payload.removed.len() as i64;
                existing.soft_deleted_count = payload.soft_deleted.len() as i64;
                existing.payload = Some(compressed);
                existing.sync_status = DeltaSyncStatus::Pending;
                existing.retry_count += 1;
                existing.sync_run_id = Some(ctx.run.id.clone());
                existing.last_error = None;
                existing.updated_at = now;
                let (deltas, row) = (&self.deltas, &existing);
                let delta = self
                    .with_store_retry(ctx, "Delta update", move |_| {
                        deltas.update_delta(row.clone())
                    })
                    .await?;
                let step = ctx.run.note(
                    format!(
                        "Reusing delta {} for v{} (retry {})",
                        delta.id, target.version, delta.retry_count
                    ),
                    None,
                );
                ctx.record(step);
                return Ok(delta);
            }
        }

        let delta = Delta {
            id: Uuid::now_v7().to_string(),
            scope: payload.scope.clone(),
            source_snapshot_id,
            source_version: payload.source_version,
            target_snapshot_id: target.id.clone(),
            target_version: target.version,
            delta_type: payload.delta_type,
            added_count: payload.added.len() as i64,
            updated_count: payload.updated.len() as i64,
            removed_count: payload.removed.len() as i64,
            soft_deleted_count: payload.soft_deleted.len() as i64,
            payload: Some(compressed),
            sync_status: DeltaSyncStatus::Pending,
            retry_count: 0,
            sync_run_id: Some(ctx.run.id.clone()),
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let (deltas, row) = (&self.deltas, &delta);
        self.with_store_retry(ctx, "Delta insert", move |_| deltas.insert_delta(row.clone()))
            .await
    }

    /// Audit rows for the delta's deletions; returns the ids still to sync.
    async fn record_deletions(&self, ctx: &mut RunContext, payload: &DeltaPayload) -> Result<Vec<String>> {
        let Some(delta_id) = ctx.delta.as_ref().map(|d| d.id.clone()) else {
            return Ok(Vec::new());
        };
        let existing = self.deletions.list_for_delta(&delta_id)?;
        let pending: Vec<String> = if existing.is_empty() {
            let records = deletion_records(
                payload,
                Some(&delta_id),
                self.config.deletion_retention_days,
                Utc::now(),
            );
            let ids = records.iter().map(|r| r.id.clone()).collect();
            if !records.is_empty() {
                let (deletions, rows) = (&self.deletions, &records);
                self.with_store_retry(ctx, "Deletion insert", move |_| {
                    deletions.insert_deletions(rows.clone())
                })
                .await?;
            }
            ids
        } else {
            existing
                .into_iter()
                .filter(|d| d.sync_status != DeletionSyncStatus::Synced)
                .map(|d| d.id)
                .collect()
        };

        let step = ctx.run.note(
            format!("{} deletions pending downstream", pending.len()),
            Some(StepData::DeletionsRecorded {
                count: pending.len() as i64,
            }),
        );
        ctx.record(step);
        Ok(pending)
    }

    async fn finalize_mappings(
        &self,
        ctx: &mut RunContext,
        catalog: &Catalog,
        payload: &DeltaPayload,
    ) -> Result<()> {
        let scope = ctx.scope();
        let delivered: HashSet<MappingKey> = payload
            .changes()
            .chain(payload.referenced.iter())
            .map(DeltaEntry::key)
            .collect();
        let ids: Vec<String> = self
            .mapper
            .list(&scope, None)?
            .into_iter()
            .filter(|m| delivered.contains(&m.key()))
            .map(|m| m.id)
            .collect();
        let (mapper, ids, scope_ref) = (&self.mapper, &ids, &scope);
        let synced = self
            .with_store_retry(ctx, "Mapping sync mark", move |_| mapper.mark_synced(ids.clone()))
            .await?;
        let deactivated = self
            .with_store_retry(ctx, "Mapping deactivation", move |_| {
                mapper.deactivate_missing_from(scope_ref, catalog)
            })
            .await?;
        debug!(
            "[MenuSync] Run {} marked {} mappings synced, deactivated {}",
            ctx.run.id, synced, deactivated
        );
        Ok(())
    }

    async fn update_delta_status(
        &self,
        ctx: &mut RunContext,
        status: DeltaSyncStatus,
        error: Option<String>,
    ) -> Result<()> {
        let Some(mut delta) = ctx.delta.clone() else {
            return Ok(());
        };
        let now = Utc::now();
        delta.sync_status = status;
        delta.last_error = error;
        delta.updated_at = now;
        if status.is_delivered() {
            delta.completed_at = Some(now);
        }
        let (deltas, row) = (&self.deltas, &delta);
        let updated = self
            .with_store_retry(ctx, "Delta status update", move |_| {
                deltas.update_delta(row.clone())
            })
            .await?;
        ctx.delta = Some(updated);
        Ok(())
    }

    async fn checkpoint(
        &self,
        ctx: &mut RunContext,
        phase: SyncPhase,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        self.enter_phase(ctx, phase).await
    }

    async fn enter_phase(&self, ctx: &mut RunContext, phase: SyncPhase) -> Result<()> {
        let step = ctx.run.enter_phase(phase)?;
        ctx.record(step);
        ctx.attempts = 0;
        self.renew_leases(ctx).await?;
        self.flush(ctx).await
    }

    async fn renew_leases(&self, ctx: &RunContext) -> Result<()> {
        for lease in ctx.leases() {
            if !self.guard.renew(lease).await? {
                return Err(Error::Conflict(format!(
                    "Lost idempotency lease {} to another worker",
                    lease.key
                )));
            }
        }
        Ok(())
    }

    async fn flush(&self, ctx: &mut RunContext) -> Result<()> {
        let saved = self
            .runs
            .save_run(ctx.run.clone(), ctx.steps.clone())
            .await?;
        ctx.run = saved;
        ctx.steps.clear();
        Ok(())
    }

    async fn release(&self, lease: &IdempotencyLease, error: Option<&str>) {
        let released = match error {
            None => self.guard.mark_succeeded(lease).await,
            Some(message) => self.guard.mark_failed(lease, message).await,
        };
        match released {
            Ok(true) => {}
            Ok(false) => warn!(
                "[MenuSync] Lease {} was lost before release (owner {})",
                lease.key, lease.owner_id
            ),
            Err(err) => error!("[MenuSync] Failed to release lease {}: {}", lease.key, err),
        }
    }

    async fn release_all(&self, ctx: &RunContext, error: Option<&str>) {
        for lease in ctx.leases() {
            self.release(lease, error).await;
        }
    }

    async fn finish_completed(&self, mut ctx: RunContext, outcome: RunOutcome) -> Result<SyncReport> {
        self.release_all(&ctx, None).await;
        let step = ctx.run.complete(outcome)?;
        ctx.record(step);
        self.flush(&mut ctx).await?;

        let disposition = match SkipReason::from_outcome(outcome) {
            Some(reason) => SyncDisposition::Skipped { reason },
            None => SyncDisposition::Synced,
        };
        info!(
            "[MenuSync] Run {} for scope={} completed: {} in {} ms",
            ctx.run.id,
            ctx.run.scope,
            outcome.as_str(),
            ctx.run.duration_ms.unwrap_or_default()
        );
        Ok(self.report(ctx, disposition, None))
    }

    async fn finish_cancelled(&self, mut ctx: RunContext, err: Error) -> Result<SyncReport> {
        let reason = match &err {
            Error::Cancelled(message) => message.clone(),
            other => format!("Cancelled after error: {}", other.summary()),
        };
        warn!(
            "[MenuSync] Run {} for scope={} cancelled in {:?}",
            ctx.run.id, ctx.run.scope, ctx.run.current_phase
        );
        self.release_all(&ctx, Some(&reason)).await;
        if let Err(delta_err) = self.fail_delta(&mut ctx, &reason).await {
            error!("[MenuSync] Could not mark delta of run {} failed: {}", ctx.run.id, delta_err);
        }

        let step = match ctx.run.cancel(&reason) {
            Ok(step) => step,
            Err(_) => ctx.run.fail(&err, ctx.attempts.max(1))?,
        };
        ctx.record(step);
        self.flush(&mut ctx).await?;
        Ok(self.report(ctx, SyncDisposition::Cancelled, None))
    }

    async fn finish_failed(&self, mut ctx: RunContext, err: Error) -> Result<SyncReport> {
        let failure_type = err.failure_type();
        let attempts = ctx.request.prior_attempts + ctx.attempts.max(1);
        let phase = ctx.run.current_phase;
        error!(
            "[MenuSync] Run {} for scope={} failed in {:?} after {} attempts ({}): {}",
            ctx.run.id,
            ctx.run.scope,
            phase,
            attempts,
            failure_type.as_str(),
            err
        );

        let mut dead_letter = NewDeadLetter::from_error(
            ctx.run.correlation_id.clone(),
            ctx.scope(),
            ctx.failed_operation(),
            &err,
            attempts,
        )
        .with_run(ctx.run.id.clone())
        .with_context("trigger", ctx.request.trigger_source.as_str());
        if let Some(phase) = phase {
            dead_letter = dead_letter.with_context("phase", phase.as_str());
        }
        let dead_letter_id = match self.dlq.store_failure(dead_letter).await {
            Ok(entry) => {
                let step = ctx.run.note(
                    format!("Dead-lettered as {}", entry.id),
                    Some(StepData::DeadLettered {
                        entry_id: entry.id.clone(),
                        failure_type: entry.failure_type,
                        attempt_count: entry.attempt_count,
                    }),
                );
                ctx.record(step);
                Some(entry.id)
            }
            Err(dlq_err) => {
                error!(
                    "[MenuSync] Could not dead-letter run {}: {}",
                    ctx.run.id, dlq_err
                );
                None
            }
        };

        let summary = err.summary();
        if let Err(delta_err) = self.fail_delta(&mut ctx, &summary).await {
            error!("[MenuSync] Could not mark delta of run {} failed: {}", ctx.run.id, delta_err);
        }
        self.release_all(&ctx, Some(&summary)).await;

        let step = ctx.run.fail(&err, attempts)?;
        ctx.record(step);
        self.flush(&mut ctx).await?;

        let disposition = SyncDisposition::Failed {
            failure_type,
            retryable: ctx.run.can_retry,
        };
        Ok(self.report(ctx, disposition, dead_letter_id))
    }

    /// Marks the undelivered delta of the run and its pending deletions failed.
    async fn fail_delta(&self, ctx: &mut RunContext, error: &str) -> Result<()> {
        let Some(delta) = ctx.delta.as_ref() else {
            return Ok(());
        };
        if ctx.delivered || delta.sync_status.is_delivered() {
            return Ok(());
        }
        let delta_id = delta.id.clone();
        self.update_delta_status(ctx, DeltaSyncStatus::Failed, Some(error.to_string()))
            .await?;

        let pending: Vec<String> = self
            .deletions
            .list_for_delta(&delta_id)?
            .into_iter()
            .filter(|d| d.sync_status == DeletionSyncStatus::Pending)
            .map(|d| d.id)
            .collect();
        if !pending.is_empty() {
            self.deletions
                .update_status(
                    pending,
                    DeletionSyncStatus::Failed,
                    Some(error.to_string()),
                    Utc::now(),
                )
                .await?;
        }
        Ok(())
    }

    fn report(
        &self,
        ctx: RunContext,
        disposition: SyncDisposition,
        dead_letter_id: Option<String>,
    ) -> SyncReport {
        SyncReport {
            scope: ctx.run.scope.clone(),
            correlation_id: ctx.run.correlation_id.clone(),
            disposition,
            run: Some(ctx.run),
            dead_letter_id,
        }
    }
}
