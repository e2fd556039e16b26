use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogEntity, EntityType};
use crate::scope::SyncScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionReason {
    /// Present in the previous snapshot, absent from the current fetch.
    RemovedFromSource,
    /// Active flag flipped to false upstream.
    Deactivated,
    /// Still returned upstream but flagged deleted.
    MarkedDeleted,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemovedFromSource => "RemovedFromSource",
            Self::Deactivated => "Deactivated",
            Self::MarkedDeleted => "MarkedDeleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RemovedFromSource" => Some(Self::RemovedFromSource),
            "Deactivated" => Some(Self::Deactivated),
            "MarkedDeleted" => Some(Self::MarkedDeleted),
            _ => None,
        }
    }
}

/// Who observed the deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionSource {
    CatalogSync,
    Manual,
}

impl DeletionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CatalogSync => "catalog_sync",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "catalog_sync" => Some(Self::CatalogSync),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionSyncStatus {
    Pending,
    Synced,
    Failed,
}

impl DeletionSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Audit record of an entity soft-deleted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDeletion {
    pub id: String,
    pub scope: SyncScope,
    pub entity_type: EntityType,
    pub source_id: String,
    pub remote_code: String,
    pub name: String,
    pub reason: DeletionReason,
    pub source: DeletionSource,
    /// Full entity as last seen, for rollback.
    pub entity_snapshot: CatalogEntity,
    pub delta_id: Option<String>,
    pub snapshot_version: Option<i64>,
    pub sync_status: DeletionSyncStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}
