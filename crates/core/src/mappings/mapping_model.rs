use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::EntityType;
use crate::scope::SyncScope;

/// Durable link between an upstream entity id and its downstream remote code.
///
/// Mappings are never deleted; an entity that disappears upstream only
/// deactivates its mapping so historical deltas stay resolvable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMapping {
    pub id: String,
    pub scope: SyncScope,
    pub entity_type: EntityType,
    pub source_id: String,
    pub remote_code: String,
    /// Identifier assigned by the downstream side, when it reports one.
    pub remote_internal_id: Option<String>,
    pub parent_mapping_id: Option<String>,
    /// Upstream id of the parent, kept so the link can be resolved later.
    pub parent_source_id: Option<String>,
    pub name: String,
    pub is_active: bool,
    pub sync_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ItemMapping {
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.entity_type, &self.source_id)
    }

    /// Parent id is known but the parent mapping was not resolved yet.
    pub fn needs_relink(&self) -> bool {
        self.parent_source_id.is_some() && self.parent_mapping_id.is_none()
    }
}

/// Lookup key of a mapping within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingKey {
    pub entity_type: EntityType,
    pub source_id: String,
}

impl MappingKey {
    pub fn new(entity_type: EntityType, source_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            source_id: source_id.into(),
        }
    }
}

impl std::fmt::Display for MappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.source_id)
    }
}

/// Result of a mapping consistency sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRepairReport {
    pub scanned: usize,
    pub duplicate_codes: usize,
    pub deactivated_duplicates: usize,
    pub orphans_cleared: usize,
    pub relinked: usize,
}

impl MappingRepairReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_codes == 0 && self.orphans_cleared == 0 && self.relinked == 0
    }
}
