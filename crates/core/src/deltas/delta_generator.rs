//! Field-level diff between the downstream baseline and the current catalog.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use uuid::Uuid;

use crate::catalog::{normalize, Catalog, CatalogEntity, EntityType};
use crate::errors::{Error, Result};
use crate::mappings::{MappingKey, StableIdMapper};
use crate::scope::SyncScope;
use crate::snapshots::{ChangeDetectionResult, ChangeDetector};

use super::deletion_model::{DeletionReason, DeletionSource, DeletionSyncStatus, ItemDeletion};
use super::delta_model::{
    flatten, ChangeKind, ChangedField, DeltaEntry, DeltaPayload, DeltaType, FieldValue,
    TrackedField,
};

/// Produces [`DeltaPayload`]s and keeps item mappings current while doing so.
#[derive(Clone)]
pub struct DeltaGenerator {
    detector: ChangeDetector,
    mapper: StableIdMapper,
}

impl DeltaGenerator {
    pub fn new(detector: ChangeDetector, mapper: StableIdMapper) -> Self {
        Self { detector, mapper }
    }

    /// Diffs `current` against the baseline snapshot of `change`.
    ///
    /// First syncs and forced runs emit every current entity as `Add`; a
    /// forced run still reports removals and soft deletes against the
    /// baseline when its catalog is available. An incremental run whose
    /// baseline has no stored catalog falls back to a full resync.
    pub async fn generate_delta(
        &self,
        scope: &SyncScope,
        current: &Catalog,
        change: &ChangeDetectionResult,
        target_version: Option<i64>,
        force_full: bool,
    ) -> Result<DeltaPayload> {
        let previous = match change.baseline_snapshot.as_ref() {
            Some(baseline) => self.detector.load_catalog(baseline)?,
            None => None,
        };

        let delta_type = if change.is_first_sync {
            DeltaType::FirstSync
        } else if force_full {
            DeltaType::FullResync
        } else if previous.is_none() {
            warn!(
                "[MenuSync] Baseline v{:?} of scope={} has no stored catalog, sending full resync",
                change.baseline_version(),
                scope
            );
            DeltaType::FullResync
        } else {
            DeltaType::Incremental
        };

        self.build(
            scope,
            previous.as_ref(),
            current,
            delta_type,
            change.baseline_version(),
            target_version,
            change.current_hash.clone(),
        )
        .await
    }

    /// Full resync of `current` without any baseline, used when versioning is off.
    pub async fn full_resync(
        &self,
        scope: &SyncScope,
        current: &Catalog,
        content_hash: String,
    ) -> Result<DeltaPayload> {
        self.build(
            scope,
            None,
            current,
            DeltaType::FullResync,
            None,
            None,
            content_hash,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        &self,
        scope: &SyncScope,
        previous: Option<&Catalog>,
        current: &Catalog,
        delta_type: DeltaType,
        source_version: Option<i64>,
        target_version: Option<i64>,
        content_hash: String,
    ) -> Result<DeltaPayload> {
        let current = normalize(current)?;
        let changes = compute_changes(previous, &current, delta_type != DeltaType::Incremental)?;
        let mappings = self.mapper.bulk_create_or_update(scope, &current).await?;

        let source_version = match delta_type {
            DeltaType::FirstSync => None,
            _ => source_version,
        };
        let mut payload =
            DeltaPayload::new(delta_type, scope.clone(), source_version, target_version, content_hash);

        for change in changes {
            let key = MappingKey::new(change.entity.entity_type(), change.entity.id());
            let remote_code = match mappings.get(&key) {
                Some(mapping) => mapping.remote_code.clone(),
                None => self
                    .mapper
                    .resolve_remote_code(scope, key.entity_type, &key.source_id)?,
            };
            payload.push(DeltaEntry {
                kind: change.kind,
                entity: change.entity,
                remote_code,
                changed_fields: change.changed_fields,
                deletion_reason: change.deletion_reason,
            });
        }

        debug!(
            "[MenuSync] Generated {} delta for scope={}: +{} ~{} -{} soft-deleted={} referenced={}",
            delta_type.as_str(),
            scope,
            payload.added.len(),
            payload.updated.len(),
            payload.removed.len(),
            payload.soft_deleted.len(),
            payload.referenced.len()
        );
        Ok(payload)
    }
}

/// Audit records for every removal and soft delete in `payload`.
pub fn deletion_records(
    payload: &DeltaPayload,
    delta_id: Option<&str>,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Vec<ItemDeletion> {
    payload
        .deletions()
        .map(|entry| ItemDeletion {
            id: Uuid::now_v7().to_string(),
            scope: payload.scope.clone(),
            entity_type: entry.entity_type(),
            source_id: entry.source_id().to_string(),
            remote_code: entry.remote_code.clone(),
            name: entry.entity.name().to_string(),
            reason: entry
                .deletion_reason
                .unwrap_or(DeletionReason::RemovedFromSource),
            source: DeletionSource::CatalogSync,
            entity_snapshot: entry.entity.clone(),
            delta_id: delta_id.map(str::to_string),
            snapshot_version: payload.target_version,
            sync_status: DeletionSyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            synced_at: None,
            expires_at: now + Duration::days(retention_days),
        })
        .collect()
}

struct EntityChange {
    kind: ChangeKind,
    entity: CatalogEntity,
    changed_fields: Vec<ChangedField>,
    deletion_reason: Option<DeletionReason>,
}

impl EntityChange {
    fn new(kind: ChangeKind, entity: CatalogEntity) -> Self {
        Self {
            kind,
            entity,
            changed_fields: Vec::new(),
            deletion_reason: None,
        }
    }
}

fn index(catalog: &Catalog) -> BTreeMap<MappingKey, CatalogEntity> {
    flatten(catalog)
        .into_iter()
        .map(|e| (MappingKey::new(e.entity_type(), e.id()), e))
        .collect()
}

fn compute_changes(
    previous: Option<&Catalog>,
    current: &Catalog,
    emit_all: bool,
) -> Result<Vec<EntityChange>> {
    let previous = previous.map(index).unwrap_or_default();
    let current_index = index(current);
    let mut changes = Vec::new();

    for (key, entity) in &current_index {
        let prior = previous.get(key);

        if let Some(prior) = prior {
            if prior.is_live() && !entity.is_live() {
                let mut change = EntityChange::new(ChangeKind::SoftDelete, entity.clone());
                change.changed_fields = changed_fields(prior, entity);
                change.deletion_reason = Some(if entity.is_deleted() {
                    DeletionReason::MarkedDeleted
                } else {
                    DeletionReason::Deactivated
                });
                changes.push(change);
                continue;
            }
        }

        match prior {
            None if entity.is_deleted() => {
                debug!("[MenuSync] Ignoring never-synced deleted {}", key);
            }
            None => changes.push(EntityChange::new(ChangeKind::Add, entity.clone())),
            Some(_) if emit_all && !entity.is_deleted() => {
                changes.push(EntityChange::new(ChangeKind::Add, entity.clone()))
            }
            Some(prior) => {
                let fields = changed_fields(prior, entity);
                if !fields.is_empty() {
                    let mut change = EntityChange::new(ChangeKind::Update, entity.clone());
                    change.changed_fields = fields;
                    changes.push(change);
                }
            }
        }
    }

    for (key, entity) in &previous {
        if !current_index.contains_key(key) {
            let mut change = EntityChange::new(ChangeKind::Remove, entity.clone());
            change.deletion_reason = Some(DeletionReason::RemovedFromSource);
            changes.push(change);
        }
    }

    let references = referenced_entities(&changes, &current_index)?;
    changes.extend(
        references
            .into_iter()
            .map(|entity| EntityChange::new(ChangeKind::Reference, entity)),
    );
    Ok(changes)
}

/// Unchanged categories and modifiers that changed products or options point at.
fn referenced_entities(
    changes: &[EntityChange],
    current: &BTreeMap<MappingKey, CatalogEntity>,
) -> Result<Vec<CatalogEntity>> {
    let changed: HashSet<MappingKey> = changes
        .iter()
        .map(|c| MappingKey::new(c.entity.entity_type(), c.entity.id()))
        .collect();
    let mut wanted: BTreeMap<MappingKey, String> = BTreeMap::new();

    for change in changes
        .iter()
        .filter(|c| matches!(c.kind, ChangeKind::Add | ChangeKind::Update | ChangeKind::SoftDelete))
    {
        match &change.entity {
            CatalogEntity::Product(product)
                if matches!(change.kind, ChangeKind::Add | ChangeKind::Update) =>
            {
                if let Some(category_id) = product.category_id.as_deref() {
                    wanted.insert(
                        MappingKey::new(EntityType::Category, category_id),
                        product.id.clone(),
                    );
                }
                for modifier_id in &product.modifier_ids {
                    wanted.insert(
                        MappingKey::new(EntityType::Modifier, modifier_id.as_str()),
                        product.id.clone(),
                    );
                }
            }
            CatalogEntity::ModifierOption { modifier_id, option } => {
                wanted.insert(
                    MappingKey::new(EntityType::Modifier, modifier_id.as_str()),
                    option.id.clone(),
                );
            }
            _ => {}
        }
    }

    let mut referenced = Vec::new();
    for (key, referrer) in wanted {
        let Some(entity) = current.get(&key) else {
            return Err(Error::MissingMapping(format!(
                "{} referenced by '{}' is not in the catalog",
                key, referrer
            )));
        };
        if !changed.contains(&key) {
            referenced.push(entity.clone());
        }
    }
    Ok(referenced)
}

fn text(value: &str) -> FieldValue {
    FieldValue::Text(Some(value.to_string()))
}

fn id_set(ids: &[String]) -> Vec<String> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();
    ids
}

fn changed_fields(previous: &CatalogEntity, current: &CatalogEntity) -> Vec<ChangedField> {
    let mut fields = Vec::new();
    let mut compare = |field: TrackedField, before: FieldValue, after: FieldValue| {
        if before != after {
            fields.push(ChangedField {
                field,
                previous: before,
                current: after,
            });
        }
    };

    match (previous, current) {
        (CatalogEntity::Product(a), CatalogEntity::Product(b)) => {
            compare(TrackedField::Name, text(&a.name), text(&b.name));
            compare(
                TrackedField::Price,
                FieldValue::Decimal(a.price.normalize()),
                FieldValue::Decimal(b.price.normalize()),
            );
            compare(TrackedField::IsActive, FieldValue::Bool(a.is_active), FieldValue::Bool(b.is_active));
            compare(
                TrackedField::IsDeleted,
                FieldValue::Bool(a.is_deleted),
                FieldValue::Bool(b.is_deleted),
            );
            compare(
                TrackedField::Description,
                FieldValue::Text(a.description.clone()),
                FieldValue::Text(b.description.clone()),
            );
            compare(
                TrackedField::Category,
                FieldValue::Text(a.category_id.clone()),
                FieldValue::Text(b.category_id.clone()),
            );
            compare(
                TrackedField::Modifiers,
                FieldValue::Ids(id_set(&a.modifier_ids)),
                FieldValue::Ids(id_set(&b.modifier_ids)),
            );
            compare(
                TrackedField::MenuGroups,
                FieldValue::Ids(id_set(&a.menu_group_ids)),
                FieldValue::Ids(id_set(&b.menu_group_ids)),
            );
        }
        (CatalogEntity::Category(a), CatalogEntity::Category(b)) => {
            compare(TrackedField::Name, text(&a.name), text(&b.name));
            compare(
                TrackedField::Description,
                FieldValue::Text(a.description.clone()),
                FieldValue::Text(b.description.clone()),
            );
            compare(TrackedField::IsActive, FieldValue::Bool(a.is_active), FieldValue::Bool(b.is_active));
            compare(
                TrackedField::IsDeleted,
                FieldValue::Bool(a.is_deleted),
                FieldValue::Bool(b.is_deleted),
            );
            compare(
                TrackedField::SortOrder,
                FieldValue::Integer(Some(i64::from(a.sort_order))),
                FieldValue::Integer(Some(i64::from(b.sort_order))),
            );
        }
        (CatalogEntity::Modifier(a), CatalogEntity::Modifier(b)) => {
            compare(TrackedField::Name, text(&a.name), text(&b.name));
            compare(TrackedField::IsActive, FieldValue::Bool(a.is_active), FieldValue::Bool(b.is_active));
            compare(
                TrackedField::IsDeleted,
                FieldValue::Bool(a.is_deleted),
                FieldValue::Bool(b.is_deleted),
            );
            compare(
                TrackedField::MinSelection,
                FieldValue::Integer(Some(i64::from(a.min_selection))),
                FieldValue::Integer(Some(i64::from(b.min_selection))),
            );
            compare(
                TrackedField::MaxSelection,
                FieldValue::Integer(a.max_selection.map(i64::from)),
                FieldValue::Integer(b.max_selection.map(i64::from)),
            );
        }
        (
            CatalogEntity::ModifierOption {
                modifier_id: parent_a,
                option: a,
            },
            CatalogEntity::ModifierOption {
                modifier_id: parent_b,
                option: b,
            },
        ) => {
            compare(TrackedField::Name, text(&a.name), text(&b.name));
            compare(
                TrackedField::Price,
                FieldValue::Decimal(a.price.normalize()),
                FieldValue::Decimal(b.price.normalize()),
            );
            compare(TrackedField::IsActive, FieldValue::Bool(a.is_active), FieldValue::Bool(b.is_active));
            compare(
                TrackedField::IsDeleted,
                FieldValue::Bool(a.is_deleted),
                FieldValue::Bool(b.is_deleted),
            );
            compare(TrackedField::ParentModifier, text(parent_a), text(parent_b));
        }
        _ => {}
    }
    fields
}
