use serde::{Deserialize, Serialize};

use crate::errors::{FailureType, Result};
use crate::idempotency::ClaimDecision;
use crate::mappings::MappingRepairReport;
use crate::runs::{RunOutcome, SyncRun, TriggerSource};
use crate::scope::SyncScope;

/// One invocation of the engine for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSyncRequest {
    pub scope: SyncScope,
    pub force_full: bool,
    pub trigger_source: TriggerSource,
    pub initiated_by: Option<String>,
    /// Failed run this attempt retries.
    pub parent_run_id: Option<String>,
    /// Reused when replaying or retrying so related attempts share one id.
    pub correlation_id: Option<String>,
    /// Attempts already spent on this operation by earlier runs.
    pub prior_attempts: i32,
}

impl RunSyncRequest {
    pub fn new(scope: SyncScope, trigger_source: TriggerSource) -> Self {
        Self {
            scope,
            force_full: false,
            trigger_source,
            initiated_by: None,
            parent_run_id: None,
            correlation_id: None,
            prior_attempts: 0,
        }
    }

    pub fn scheduled(scope: SyncScope) -> Self {
        Self::new(scope, TriggerSource::Scheduled)
    }

    pub fn manual(scope: SyncScope, initiated_by: impl Into<String>) -> Self {
        Self {
            initiated_by: Some(initiated_by.into()),
            ..Self::new(scope, TriggerSource::Manual)
        }
    }

    pub fn with_force_full(mut self, force_full: bool) -> Self {
        self.force_full = force_full;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Why a trigger performed no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another attempt for the scope holds the job lock.
    ScopeBusy,
    /// The job bucket already completed.
    AlreadySynced,
    Unchanged,
    NoEligibleItems,
    DuplicateContent,
    NoTrackedChanges,
}

impl SkipReason {
    pub fn from_outcome(outcome: RunOutcome) -> Option<Self> {
        match outcome {
            RunOutcome::Synced => None,
            RunOutcome::Unchanged => Some(Self::Unchanged),
            RunOutcome::NoEligibleItems => Some(Self::NoEligibleItems),
            RunOutcome::DuplicateContent => Some(Self::DuplicateContent),
            RunOutcome::NoTrackedChanges => Some(Self::NoTrackedChanges),
        }
    }

    pub(crate) fn from_refused_claim(decision: ClaimDecision) -> Self {
        match decision {
            ClaimDecision::AlreadySucceeded => Self::AlreadySynced,
            _ => Self::ScopeBusy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncDisposition {
    Synced,
    Skipped {
        reason: SkipReason,
    },
    Failed {
        failure_type: FailureType,
        retryable: bool,
    },
    Cancelled,
}

/// What a trigger did. `run` is absent when the job lock refused the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub scope: SyncScope,
    pub correlation_id: String,
    pub disposition: SyncDisposition,
    pub run: Option<SyncRun>,
    pub dead_letter_id: Option<String>,
}

impl SyncReport {
    pub fn is_skip(&self) -> bool {
        matches!(self.disposition, SyncDisposition::Skipped { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.disposition {
            SyncDisposition::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result for one scope of a batch trigger.
#[derive(Debug)]
pub struct BatchResult {
    pub scope: SyncScope,
    pub result: Result<SyncReport>,
}

/// Rows removed or repaired by one maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub snapshots_pruned: usize,
    pub deltas_pruned: usize,
    pub runs_pruned: usize,
    pub deletions_purged: usize,
    pub idempotency_records_purged: usize,
    pub mappings: MappingRepairReport,
}
