use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deltas::DeltaType;
use crate::errors::{Error, FailureType};
use crate::runs::SyncPhase;
use crate::scope::SyncScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl DlqPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Permanent failures need an operator; transient ones are swept automatically.
    pub fn for_failure(failure_type: FailureType) -> Self {
        match failure_type {
            FailureType::Permanent => Self::High,
            FailureType::Transient => Self::Normal,
        }
    }
}

/// The operation that failed, with what is needed to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    CatalogFetch {
        force_full: bool,
    },
    DeltaSubmission {
        force_full: bool,
        delta_id: Option<String>,
        delta_type: DeltaType,
        target_version: Option<i64>,
        total_changes: i64,
    },
    Processing {
        force_full: bool,
        phase: Option<SyncPhase>,
    },
}

impl DeadLetterPayload {
    pub fn force_full(&self) -> bool {
        match self {
            Self::CatalogFetch { force_full }
            | Self::DeltaSubmission { force_full, .. }
            | Self::Processing { force_full, .. } => *force_full,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::CatalogFetch { .. } => "catalog_fetch",
            Self::DeltaSubmission { .. } => "delta_submission",
            Self::Processing { .. } => "processing",
        }
    }
}

/// Append-only record of a terminally failed operation.
///
/// Only `replayed_by_run_id`/`replayed_at` are ever written after insert,
/// and only once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    pub correlation_id: String,
    pub scope: SyncScope,
    pub sync_run_id: Option<String>,
    pub payload: DeadLetterPayload,
    pub error_code: String,
    pub error_message: String,
    pub failure_type: FailureType,
    pub attempt_count: i32,
    pub priority: DlqPriority,
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub replayed_by_run_id: Option<String>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn is_replayed(&self) -> bool {
        self.replayed_by_run_id.is_some()
    }
}

/// Input of [`super::DeadLetterQueue::store_failure`].
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub correlation_id: String,
    pub scope: SyncScope,
    pub sync_run_id: Option<String>,
    pub payload: DeadLetterPayload,
    pub error_code: String,
    pub error_message: String,
    pub failure_type: FailureType,
    pub attempt_count: i32,
    pub priority: DlqPriority,
    pub context: BTreeMap<String, String>,
}

impl NewDeadLetter {
    /// Classifies `error` and picks the default priority for it.
    pub fn from_error(
        correlation_id: impl Into<String>,
        scope: SyncScope,
        payload: DeadLetterPayload,
        error: &Error,
        attempt_count: i32,
    ) -> Self {
        let failure_type = error.failure_type();
        Self {
            correlation_id: correlation_id.into(),
            scope,
            sync_run_id: None,
            payload,
            error_code: error.code().to_string(),
            error_message: error.to_string(),
            failure_type,
            attempt_count,
            priority: DlqPriority::for_failure(failure_type),
            context: BTreeMap::new(),
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.sync_run_id = Some(run_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
