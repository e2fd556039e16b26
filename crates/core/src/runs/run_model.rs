//! Sync run state machine and its append-only step trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deltas::DeltaType;
use crate::errors::{Error, FailureType, Result};
use crate::scope::SyncScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a running sync, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initialization,
    DataFetch,
    ChangeDetection,
    DeltaGeneration,
    SoftDeleteProcessing,
    Submission,
    Finalization,
    Cleanup,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::DataFetch => "data_fetch",
            Self::ChangeDetection => "change_detection",
            Self::DeltaGeneration => "delta_generation",
            Self::SoftDeleteProcessing => "soft_delete_processing",
            Self::Submission => "submission",
            Self::Finalization => "finalization",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initialization" => Some(Self::Initialization),
            "data_fetch" => Some(Self::DataFetch),
            "change_detection" => Some(Self::ChangeDetection),
            "delta_generation" => Some(Self::DeltaGeneration),
            "soft_delete_processing" => Some(Self::SoftDeleteProcessing),
            "submission" => Some(Self::Submission),
            "finalization" => Some(Self::Finalization),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }

    /// Progress reported when the phase starts.
    pub fn entry_progress(&self) -> i32 {
        match self {
            Self::Initialization => 0,
            Self::DataFetch => 10,
            Self::ChangeDetection => 30,
            Self::DeltaGeneration => 40,
            Self::SoftDeleteProcessing => 55,
            Self::Submission => 65,
            Self::Finalization => 85,
            Self::Cleanup => 95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Incremental,
    Full,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incremental" => Some(Self::Incremental),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Manual,
    Retry,
    DeadLetterReplay,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Retry => "retry",
            Self::DeadLetterReplay => "dead_letter_replay",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            "retry" => Some(Self::Retry),
            "dead_letter_replay" => Some(Self::DeadLetterReplay),
            _ => None,
        }
    }

    /// Triggers that may repeat work already done in the current job bucket.
    pub fn reruns_completed_bucket(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// Why a completed run did or did not submit anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Synced,
    /// Content hash matched the downstream baseline.
    Unchanged,
    /// The menu-group filter excluded every product of the scope.
    NoEligibleItems,
    /// An earlier run already delivered this exact content.
    DuplicateContent,
    /// Content changed without any tracked field changing.
    NoTrackedChanges,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Unchanged => "unchanged",
            Self::NoEligibleItems => "no_eligible_items",
            Self::DuplicateContent => "duplicate_content",
            Self::NoTrackedChanges => "no_tracked_changes",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(Self::Synced),
            "unchanged" => Some(Self::Unchanged),
            "no_eligible_items" => Some(Self::NoEligibleItems),
            "duplicate_content" => Some(Self::DuplicateContent),
            "no_tracked_changes" => Some(Self::NoTrackedChanges),
            _ => None,
        }
    }

    /// Completed with zero work performed.
    pub fn is_skip(&self) -> bool {
        !matches!(self, Self::Synced)
    }
}

/// Per-entity counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub added: i64,
    pub updated: i64,
    pub deleted: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionInfo {
    pub vendor_ref: String,
    pub import_id: Option<String>,
    pub delta_id: Option<String>,
    pub snapshot_version: Option<i64>,
    pub attempts: i32,
    #[serde(default)]
    pub item_errors: Vec<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorEntry {
    pub at: DateTime<Utc>,
    pub phase: Option<SyncPhase>,
    pub code: String,
    pub message: String,
    pub failure_type: FailureType,
    pub attempt: i32,
}

impl RunErrorEntry {
    pub fn from_error(error: &Error, phase: Option<SyncPhase>, attempt: i32) -> Self {
        Self {
            at: Utc::now(),
            phase,
            code: error.code().to_string(),
            message: error.summary(),
            failure_type: error.failure_type(),
            attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWarning {
    pub at: DateTime<Utc>,
    pub phase: Option<SyncPhase>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Created,
    Started,
    PhaseChanged,
    Info,
    Warning,
    Error,
    Retry,
    Completed,
    Failed,
    Cancelled,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::PhaseChanged => "phase_changed",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "started" => Some(Self::Started),
            "phase_changed" => Some(Self::PhaseChanged),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "retry" => Some(Self::Retry),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Typed payload attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepData {
    Progress {
        percentage: i32,
    },
    CatalogFetched {
        products: i64,
        categories: i64,
        modifiers: i64,
        eligible_products: i64,
    },
    ChangeDetected {
        has_changed: bool,
        current_hash: String,
        previous_version: i64,
        is_first_sync: bool,
    },
    DeltaGenerated {
        delta_type: DeltaType,
        target_version: Option<i64>,
        added: i64,
        updated: i64,
        removed: i64,
        soft_deleted: i64,
        referenced: i64,
    },
    DeletionsRecorded {
        count: i64,
    },
    RetryScheduled {
        attempt: i32,
        delay_ms: i64,
        code: String,
    },
    Submitted {
        import_id: Option<String>,
        attempts: i32,
        item_errors: i64,
    },
    ErrorRecorded {
        code: String,
        failure_type: FailureType,
    },
    DeadLettered {
        entry_id: String,
        failure_type: FailureType,
        attempt_count: i32,
    },
    Outcome {
        outcome: RunOutcome,
    },
}

/// Immutable trace record; `(run_id, sequence)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunStep {
    pub run_id: String,
    pub sequence: i64,
    pub step_type: StepType,
    pub phase: Option<SyncPhase>,
    pub message: String,
    pub data: Option<StepData>,
    pub created_at: DateTime<Utc>,
}

/// Parameters of a new run.
#[derive(Debug, Clone)]
pub struct NewSyncRun {
    pub id: String,
    pub correlation_id: String,
    pub scope: SyncScope,
    pub sync_type: SyncType,
    pub trigger_source: TriggerSource,
    pub initiated_by: Option<String>,
    pub max_retries: i32,
}

/// One synchronization attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: String,
    pub correlation_id: String,
    pub scope: SyncScope,
    pub sync_type: SyncType,
    pub trigger_source: TriggerSource,
    pub initiated_by: Option<String>,
    pub status: SyncRunStatus,
    pub current_phase: Option<SyncPhase>,
    pub progress_percentage: i32,
    pub counters: RunCounters,
    pub outcome: Option<RunOutcome>,
    pub submission: Option<SubmissionInfo>,
    pub errors: Vec<RunErrorEntry>,
    pub warnings: Vec<RunWarning>,
    pub failure_type: Option<FailureType>,
    pub parent_run_id: Option<String>,
    pub retry_count: i32,
    pub can_retry: bool,
    /// Sequence number of the last appended step.
    pub step_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRun {
    /// Creates a pending run; a retry links to `parent`.
    pub fn new(params: NewSyncRun, parent: Option<&SyncRun>) -> (Self, SyncRunStep) {
        let now = Utc::now();
        let retry_count = parent.map_or(0, |p| p.retry_count + 1);
        let mut run = Self {
            id: params.id,
            correlation_id: params.correlation_id,
            scope: params.scope,
            sync_type: params.sync_type,
            trigger_source: params.trigger_source,
            initiated_by: params.initiated_by,
            status: SyncRunStatus::Pending,
            current_phase: None,
            progress_percentage: 0,
            counters: RunCounters::default(),
            outcome: None,
            submission: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            failure_type: None,
            parent_run_id: parent.map(|p| p.id.clone()),
            retry_count,
            can_retry: retry_count < params.max_retries,
            step_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            updated_at: now,
        };
        let message = match parent {
            Some(p) => format!("Retry {} of run {}", retry_count, p.id),
            None => format!("Run created by {} trigger", run.trigger_source.as_str()),
        };
        let step = run.append(StepType::Created, message, None);
        (run, step)
    }

    fn append(&mut self, step_type: StepType, message: String, data: Option<StepData>) -> SyncRunStep {
        let now = Utc::now();
        self.step_count += 1;
        self.updated_at = now;
        SyncRunStep {
            run_id: self.id.clone(),
            sequence: self.step_count,
            step_type,
            phase: self.current_phase,
            message,
            data,
            created_at: now,
        }
    }

    fn transition(&mut self, target: SyncRunStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidTransition(format!(
                "Run {} cannot move from {} to {}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        Ok(())
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        let started = self.started_at.unwrap_or(self.created_at);
        self.duration_ms = Some((now - started).num_milliseconds().max(0));
    }

    pub fn start(&mut self) -> Result<SyncRunStep> {
        self.transition(SyncRunStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.current_phase = Some(SyncPhase::Initialization);
        self.progress_percentage = 0;
        Ok(self.append(StepType::Started, "Run started".to_string(), None))
    }

    /// Moves to `phase` and raises progress. Phases and progress never go backwards.
    pub fn update_progress(&mut self, phase: SyncPhase, percentage: i32) -> Result<SyncRunStep> {
        if self.status != SyncRunStatus::Running {
            return Err(Error::InvalidTransition(format!(
                "Run {} is {}, progress can only be reported while running",
                self.id, self.status
            )));
        }
        if let Some(current) = self.current_phase {
            if phase < current {
                return Err(Error::InvalidTransition(format!(
                    "Run {} cannot go back from {} to {}",
                    self.id,
                    current.as_str(),
                    phase.as_str()
                )));
            }
        }
        let changed_phase = self.current_phase != Some(phase);
        self.current_phase = Some(phase);
        self.progress_percentage = self.progress_percentage.max(percentage.clamp(0, 100));

        let (step_type, message) = if changed_phase {
            (StepType::PhaseChanged, format!("Entered {}", phase.as_str()))
        } else {
            (StepType::Info, format!("Progress in {}", phase.as_str()))
        };
        let data = StepData::Progress {
            percentage: self.progress_percentage,
        };
        Ok(self.append(step_type, message, Some(data)))
    }

    pub fn enter_phase(&mut self, phase: SyncPhase) -> Result<SyncRunStep> {
        self.update_progress(phase, phase.entry_progress())
    }

    pub fn complete(&mut self, outcome: RunOutcome) -> Result<SyncRunStep> {
        self.transition(SyncRunStatus::Completed)?;
        self.progress_percentage = 100;
        self.outcome = Some(outcome);
        self.can_retry = false;
        self.finish();
        let message = match outcome {
            RunOutcome::Synced => "Run completed".to_string(),
            other => format!("Run completed without submission ({})", other.as_str()),
        };
        Ok(self.append(StepType::Completed, message, Some(StepData::Outcome { outcome })))
    }

    /// Fails the run from any non-terminal state, keeping partial counters.
    ///
    /// Permanent failures are never retryable.
    pub fn fail(&mut self, error: &Error, attempt: i32) -> Result<SyncRunStep> {
        self.transition(SyncRunStatus::Failed)?;
        let entry = RunErrorEntry::from_error(error, self.current_phase, attempt);
        let failure_type = entry.failure_type;
        self.failure_type = Some(failure_type);
        if failure_type == FailureType::Permanent {
            self.can_retry = false;
        }
        self.errors.push(entry);
        self.finish();
        let data = StepData::ErrorRecorded {
            code: error.code().to_string(),
            failure_type,
        };
        Ok(self.append(StepType::Failed, error.summary(), Some(data)))
    }

    pub fn cancel(&mut self, reason: &str) -> Result<SyncRunStep> {
        self.transition(SyncRunStatus::Cancelled)?;
        self.finish();
        Ok(self.append(StepType::Cancelled, reason.to_string(), None))
    }

    /// Logs a non-terminal error (for example a failed attempt before a retry).
    pub fn record_error(&mut self, error: &Error, attempt: i32) -> SyncRunStep {
        let entry = RunErrorEntry::from_error(error, self.current_phase, attempt);
        let data = StepData::ErrorRecorded {
            code: entry.code.clone(),
            failure_type: entry.failure_type,
        };
        self.errors.push(entry);
        self.append(StepType::Error, error.summary(), Some(data))
    }

    pub fn add_warning(&mut self, message: impl Into<String>) -> SyncRunStep {
        let message = message.into();
        self.warnings.push(RunWarning {
            at: Utc::now(),
            phase: self.current_phase,
            message: message.clone(),
        });
        self.append(StepType::Warning, message, None)
    }

    pub fn note(&mut self, message: impl Into<String>, data: Option<StepData>) -> SyncRunStep {
        self.append(StepType::Info, message.into(), data)
    }

    pub fn note_retry(&mut self, attempt: i32, delay_ms: i64, code: &str) -> SyncRunStep {
        self.append(
            StepType::Retry,
            format!("Retrying attempt {} in {} ms", attempt, delay_ms),
            Some(StepData::RetryScheduled {
                attempt,
                delay_ms,
                code: code.to_string(),
            }),
        )
    }
}

/// Aggregated run figures for one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatistics {
    pub total: i64,
    pub running: i64,
    pub synced: i64,
    /// Completed without performing work; never counted as synced or failed.
    pub skipped: i64,
    pub unchanged: i64,
    pub no_eligible_items: i64,
    pub failed: i64,
    pub transient_failures: i64,
    pub permanent_failures: i64,
    pub cancelled: i64,
    pub average_duration_ms: Option<i64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl RunStatistics {
    pub fn from_runs(runs: &[SyncRun]) -> Self {
        let mut stats = Self {
            total: runs.len() as i64,
            ..Default::default()
        };
        let mut durations = Vec::new();

        for run in runs {
            if let Some(duration) = run.duration_ms {
                durations.push(duration);
            }
            match run.status {
                SyncRunStatus::Pending | SyncRunStatus::Running => stats.running += 1,
                SyncRunStatus::Completed => match run.outcome.filter(RunOutcome::is_skip) {
                    Some(outcome) => {
                        stats.skipped += 1;
                        match outcome {
                            RunOutcome::Unchanged => stats.unchanged += 1,
                            RunOutcome::NoEligibleItems => stats.no_eligible_items += 1,
                            _ => {}
                        }
                    }
                    None => {
                        stats.synced += 1;
                        stats.last_success_at = stats.last_success_at.max(run.completed_at);
                    }
                },
                SyncRunStatus::Failed => {
                    stats.failed += 1;
                    match run.failure_type {
                        Some(FailureType::Permanent) => stats.permanent_failures += 1,
                        _ => stats.transient_failures += 1,
                    }
                    stats.last_failure_at = stats.last_failure_at.max(run.completed_at);
                }
                SyncRunStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if !durations.is_empty() {
            stats.average_duration_ms =
                Some(durations.iter().sum::<i64>() / durations.len() as i64);
        }
        stats
    }
}
