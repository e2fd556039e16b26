use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::scope::SyncScope;

/// Lifecycle of an idempotency record. A missing record means "not started".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which logical operation a key guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyKind {
    /// Scope plus time bucket; prevents overlapping runs.
    Job,
    /// Scope plus catalog content; prevents reprocessing identical input.
    Content,
}

impl IdempotencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Content => "content",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "job" => Some(Self::Job),
            "content" => Some(Self::Content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub scope: SyncScope,
    pub kind: IdempotencyKind,
    pub status: IdempotencyStatus,
    /// Attempt that currently holds (or last held) the record.
    pub owner_id: String,
    /// Row version for compare-and-set; 1 on first insert.
    pub version: i64,
    pub attempt_count: i32,
    pub started_at: DateTime<Utc>,
    /// Lease start; refreshed by heartbeats.
    pub heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// In progress, but the holder stopped heartbeating for `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == IdempotencyStatus::InProgress && now - self.heartbeat_at >= stale_after
    }

    pub fn is_held_by(&self, owner_id: &str) -> bool {
        self.status == IdempotencyStatus::InProgress && self.owner_id == owner_id
    }
}

/// How a claim treats the record it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub stale_after: Duration,
    /// Let a new attempt run even though the key already succeeded.
    pub allow_rerun_after_success: bool,
}

impl ClaimPolicy {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            allow_rerun_after_success: false,
        }
    }

    pub fn allowing_rerun(mut self, allow: bool) -> Self {
        self.allow_rerun_after_success = allow;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimDecision {
    Acquired,
    ReclaimedStale,
    RetryAfterFailure,
    RerunAfterSuccess,
    AlreadyInProgress,
    AlreadySucceeded,
    /// Another job key of the same scope is in progress.
    ScopeBusy,
}

impl ClaimDecision {
    pub fn can_proceed(&self) -> bool {
        matches!(
            self,
            Self::Acquired | Self::ReclaimedStale | Self::RetryAfterFailure | Self::RerunAfterSuccess
        )
    }
}

/// Ownership of a claimed key, passed back to renew or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyLease {
    pub key: String,
    pub scope: SyncScope,
    pub kind: IdempotencyKind,
    pub owner_id: String,
    pub stale_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub decision: ClaimDecision,
    /// Record found before the claim, or the conflicting record when refused.
    pub existing: Option<IdempotencyRecord>,
    pub lease: Option<IdempotencyLease>,
}

impl ClaimOutcome {
    pub fn can_proceed(&self) -> bool {
        self.decision.can_proceed() && self.lease.is_some()
    }
}
