//! Delta domain models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogEntity, EntityType, Modifier, ModifierOption};
use crate::errors::{Error, Result};
use crate::mappings::MappingKey;
use crate::scope::SyncScope;

use super::deletion_model::DeletionReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    FirstSync,
    Incremental,
    FullResync,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSync => "first_sync",
            Self::Incremental => "incremental",
            Self::FullResync => "full_resync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "first_sync" => Some(Self::FirstSync),
            "incremental" => Some(Self::Incremental),
            "full_resync" => Some(Self::FullResync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Submitted, but the downstream side reported item-level errors.
    PartiallyFailed,
}

impl DeltaSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partially_failed" => Some(Self::PartiallyFailed),
            _ => None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
    SoftDelete,
    /// Unchanged entity carried for referential completeness.
    Reference,
}

/// Entity fields compared by the delta generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedField {
    Name,
    Price,
    IsActive,
    IsDeleted,
    Description,
    Category,
    Modifiers,
    MenuGroups,
    SortOrder,
    MinSelection,
    MaxSelection,
    ParentModifier,
}

impl TrackedField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Price => "price",
            Self::IsActive => "isActive",
            Self::IsDeleted => "isDeleted",
            Self::Description => "description",
            Self::Category => "category",
            Self::Modifiers => "modifiers",
            Self::MenuGroups => "menuGroups",
            Self::SortOrder => "sortOrder",
            Self::MinSelection => "minSelection",
            Self::MaxSelection => "maxSelection",
            Self::ParentModifier => "parentModifier",
        }
    }
}

/// Typed value of a tracked field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(Option<String>),
    Decimal(Decimal),
    Bool(bool),
    Integer(Option<i64>),
    Ids(Vec<String>),
}

impl FieldValue {
    /// Plain JSON rendering used in audit views (`{"name": "Burger"}`).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Text(Some(text)) => Value::String(text.clone()),
            Self::Text(None) | Self::Integer(None) => Value::Null,
            Self::Decimal(value) => Value::String(value.normalize().to_string()),
            Self::Bool(value) => Value::Bool(*value),
            Self::Integer(Some(value)) => Value::from(*value),
            Self::Ids(ids) => Value::Array(ids.iter().cloned().map(Value::String).collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedField {
    pub field: TrackedField,
    pub previous: FieldValue,
    pub current: FieldValue,
}

/// One entity-level change in a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaEntry {
    pub kind: ChangeKind,
    /// Current data; for removals, the last known data.
    pub entity: CatalogEntity,
    pub remote_code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<ChangedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_reason: Option<DeletionReason>,
}

impl DeltaEntry {
    pub fn entity_type(&self) -> EntityType {
        self.entity.entity_type()
    }

    pub fn source_id(&self) -> &str {
        self.entity.id()
    }

    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.entity_type(), self.source_id())
    }

    pub fn changed_field_names(&self) -> Vec<&'static str> {
        self.changed_fields.iter().map(|c| c.field.as_str()).collect()
    }

    pub fn previous_values(&self) -> BTreeMap<String, serde_json::Value> {
        self.changed_fields
            .iter()
            .map(|c| (c.field.as_str().to_string(), c.previous.to_json()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    pub added: i64,
    pub updated: i64,
    pub removed: i64,
    pub soft_deleted: i64,
}

impl ChangeCounts {
    pub fn total(&self) -> i64 {
        self.added + self.updated + self.removed + self.soft_deleted
    }

    fn record(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Add => self.added += 1,
            ChangeKind::Update => self.updated += 1,
            ChangeKind::Remove => self.removed += 1,
            ChangeKind::SoftDelete => self.soft_deleted += 1,
            ChangeKind::Reference => {}
        }
    }
}

/// Per-entity-type change counts of a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaStatistics {
    pub products: ChangeCounts,
    pub categories: ChangeCounts,
    pub modifiers: ChangeCounts,
    pub modifier_options: ChangeCounts,
    pub referenced: i64,
}

impl DeltaStatistics {
    pub fn for_type(&self, entity_type: EntityType) -> &ChangeCounts {
        match entity_type {
            EntityType::Product => &self.products,
            EntityType::Category => &self.categories,
            EntityType::Modifier => &self.modifiers,
            EntityType::ModifierOption => &self.modifier_options,
        }
    }

    pub fn totals(&self) -> ChangeCounts {
        let all = [
            self.products,
            self.categories,
            self.modifiers,
            self.modifier_options,
        ];
        ChangeCounts {
            added: all.iter().map(|c| c.added).sum(),
            updated: all.iter().map(|c| c.updated).sum(),
            removed: all.iter().map(|c| c.removed).sum(),
            soft_deleted: all.iter().map(|c| c.soft_deleted).sum(),
        }
    }

    pub fn total_changes(&self) -> i64 {
        self.totals().total()
    }

    fn record(&mut self, entry: &DeltaEntry) {
        if entry.kind == ChangeKind::Reference {
            self.referenced += 1;
            return;
        }
        let counts = match entry.entity_type() {
            EntityType::Product => &mut self.products,
            EntityType::Category => &mut self.categories,
            EntityType::Modifier => &mut self.modifiers,
            EntityType::ModifierOption => &mut self.modifier_options,
        };
        counts.record(entry.kind);
    }
}

/// The diff submitted downstream. Change lists are disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub delta_type: DeltaType,
    pub scope: SyncScope,
    /// Baseline version the diff was computed against.
    pub source_version: Option<i64>,
    /// Snapshot version this delta brings the downstream side to.
    pub target_version: Option<i64>,
    pub content_hash: String,
    pub added: Vec<DeltaEntry>,
    pub updated: Vec<DeltaEntry>,
    pub removed: Vec<DeltaEntry>,
    pub soft_deleted: Vec<DeltaEntry>,
    pub referenced: Vec<DeltaEntry>,
    pub statistics: DeltaStatistics,
}

impl DeltaPayload {
    pub fn new(
        delta_type: DeltaType,
        scope: SyncScope,
        source_version: Option<i64>,
        target_version: Option<i64>,
        content_hash: String,
    ) -> Self {
        Self {
            delta_type,
            scope,
            source_version,
            target_version,
            content_hash,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            soft_deleted: Vec::new(),
            referenced: Vec::new(),
            statistics: DeltaStatistics::default(),
        }
    }

    pub fn push(&mut self, entry: DeltaEntry) {
        self.statistics.record(&entry);
        match entry.kind {
            ChangeKind::Add => self.added.push(entry),
            ChangeKind::Update => self.updated.push(entry),
            ChangeKind::Remove => self.removed.push(entry),
            ChangeKind::SoftDelete => self.soft_deleted.push(entry),
            ChangeKind::Reference => self.referenced.push(entry),
        }
    }

    pub fn total_changes(&self) -> i64 {
        (self.added.len() + self.updated.len() + self.removed.len() + self.soft_deleted.len())
            as i64
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }

    /// Every change entry, excluding references.
    pub fn changes(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
            .chain(self.soft_deleted.iter())
    }

    /// Entries the downstream side must deactivate or delete explicitly.
    pub fn deletions(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.removed.iter().chain(self.soft_deleted.iter())
    }

    pub fn entry(&self, entity_type: EntityType, source_id: &str) -> Option<&DeltaEntry> {
        self.changes()
            .chain(self.referenced.iter())
            .find(|e| e.entity_type() == entity_type && e.source_id() == source_id)
    }

    /// Rebuilds the target catalog from `previous`.
    ///
    /// Entities that were flagged deleted without ever having been synced are
    /// not part of any delta and therefore absent from the result.
    pub fn apply_to(&self, previous: &Catalog) -> Result<Catalog> {
        let mut entities: BTreeMap<MappingKey, CatalogEntity> = BTreeMap::new();
        for entity in flatten(previous) {
            entities.insert(MappingKey::new(entity.entity_type(), entity.id()), entity);
        }

        for entry in self
            .added
            .iter()
            .chain(self.updated.iter())
            .chain(self.soft_deleted.iter())
        {
            entities.insert(entry.key(), strip_options(entry.entity.clone()));
        }
        for entry in &self.removed {
            if entities.remove(&entry.key()).is_none() {
                return Err(Error::validation(format!(
                    "Delta removes {} which is not in the previous catalog",
                    entry.key()
                )));
            }
        }

        Ok(assemble(entities.into_values()))
    }
}

/// Splits a catalog into individually keyed entities; modifiers lose their
/// embedded options, which become `ModifierOption` entities.
pub(crate) fn flatten(catalog: &Catalog) -> Vec<CatalogEntity> {
    let mut entities = Vec::new();
    for category in &catalog.categories {
        entities.push(CatalogEntity::Category(category.clone()));
    }
    for modifier in &catalog.modifiers {
        for option in &modifier.options {
            entities.push(CatalogEntity::ModifierOption {
                modifier_id: modifier.id.clone(),
                option: option.clone(),
            });
        }
        entities.push(strip_options(CatalogEntity::Modifier(modifier.clone())));
    }
    for product in &catalog.products {
        entities.push(CatalogEntity::Product(product.clone()));
    }
    entities
}

fn strip_options(entity: CatalogEntity) -> CatalogEntity {
    match entity {
        CatalogEntity::Modifier(modifier) => CatalogEntity::Modifier(Modifier {
            options: Vec::new(),
            ..modifier
        }),
        other => other,
    }
}

fn assemble(entities: impl Iterator<Item = CatalogEntity>) -> Catalog {
    let mut catalog = Catalog::default();
    let mut options: BTreeMap<String, Vec<ModifierOption>> = BTreeMap::new();
    for entity in entities {
        match entity {
            CatalogEntity::Product(product) => catalog.products.push(product),
            CatalogEntity::Category(category) => catalog.categories.push(category),
            CatalogEntity::Modifier(modifier) => catalog.modifiers.push(modifier),
            CatalogEntity::ModifierOption {
                modifier_id,
                option,
            } => options.entry(modifier_id).or_default().push(option),
        }
    }
    for modifier in &mut catalog.modifiers {
        if let Some(mut list) = options.remove(&modifier.id) {
            list.sort_by(|a, b| a.id.cmp(&b.id));
            modifier.options = list;
        }
    }
    catalog.products.sort_by(|a, b| a.id.cmp(&b.id));
    catalog.categories.sort_by(|a, b| a.id.cmp(&b.id));
    catalog.modifiers.sort_by(|a, b| a.id.cmp(&b.id));
    catalog
}

/// Persisted delta record linking two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub id: String,
    pub scope: SyncScope,
    /// `None` for a first sync.
    pub source_snapshot_id: Option<String>,
    pub source_version: Option<i64>,
    pub target_snapshot_id: String,
    pub target_version: i64,
    pub delta_type: DeltaType,
    pub added_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
    pub soft_deleted_count: i64,
    /// Gzip-compressed [`DeltaPayload`].
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,
    pub sync_status: DeltaSyncStatus,
    pub retry_count: i32,
    pub sync_run_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Delta {
    pub fn total_changes(&self) -> i64 {
        self.added_count + self.updated_count + self.removed_count + self.soft_deleted_count
    }
}
