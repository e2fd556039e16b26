use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogEntity, EntityType};
use crate::errors::{Error, Result};
use crate::scope::SyncScope;

use super::mapping_model::{ItemMapping, MappingKey, MappingRepairReport};
use super::mapping_traits::MappingRepositoryTrait;
use super::remote_code::remote_code;

/// Maps volatile upstream ids onto stable downstream remote codes.
#[derive(Clone)]
pub struct StableIdMapper {
    repository: Arc<dyn MappingRepositoryTrait>,
    partition_by_menu_group: bool,
}

impl StableIdMapper {
    pub fn new(repository: Arc<dyn MappingRepositoryTrait>) -> Self {
        Self {
            repository,
            partition_by_menu_group: false,
        }
    }

    pub fn with_menu_group_partitioning(mut self, enabled: bool) -> Self {
        self.partition_by_menu_group = enabled;
        self
    }

    pub fn remote_code_for(&self, scope: &SyncScope, entity_type: EntityType, source_id: &str) -> String {
        remote_code(entity_type, source_id, scope, self.partition_by_menu_group)
    }

    /// Stored remote code of an entity, or the derived one when it was never mapped.
    pub fn resolve_remote_code(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<String> {
        Ok(match self.repository.get_mapping(scope, entity_type, source_id)? {
            Some(mapping) => mapping.remote_code,
            None => self.remote_code_for(scope, entity_type, source_id),
        })
    }

    pub fn get(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<ItemMapping>> {
        self.repository.get_mapping(scope, entity_type, source_id)
    }

    pub fn list(&self, scope: &SyncScope, entity_type: Option<EntityType>) -> Result<Vec<ItemMapping>> {
        self.repository.list_mappings(scope, entity_type)
    }

    pub async fn get_or_create(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
        current_name: &str,
        parent_source_id: Option<&str>,
    ) -> Result<ItemMapping> {
        validate_source_id(entity_type, source_id)?;

        let parent_mapping_id = match (entity_type.parent_type(), parent_source_id) {
            (Some(parent_type), Some(parent_id)) => self
                .repository
                .get_mapping(scope, parent_type, parent_id)?
                .map(|parent| parent.id),
            _ => None,
        };

        let existing = self.repository.get_mapping(scope, entity_type, source_id)?;
        let mapping = self.prepare(
            scope,
            existing,
            entity_type,
            source_id,
            current_name,
            parent_source_id,
            parent_mapping_id,
            Utc::now(),
        );

        let mut stored = self.repository.upsert_mappings(vec![mapping]).await?;
        stored
            .pop()
            .ok_or_else(|| Error::internal("Mapping upsert returned no rows"))
    }

    /// Maps every live-or-inactive entity of `catalog` in one write.
    ///
    /// Parents are resolved before children so a product created in the same
    /// pass as its category links immediately. Entities flagged deleted are
    /// not mapped. Re-running with the same catalog only refreshes
    /// `last_verified_at`.
    pub async fn bulk_create_or_update(
        &self,
        scope: &SyncScope,
        catalog: &Catalog,
    ) -> Result<HashMap<MappingKey, ItemMapping>> {
        let now = Utc::now();
        let mut existing: HashMap<MappingKey, ItemMapping> = self
            .repository
            .list_mappings(scope, None)?
            .into_iter()
            .map(|m| (m.key(), m))
            .collect();

        let mut prepared: HashMap<MappingKey, ItemMapping> = HashMap::new();
        let mut ordered: Vec<ItemMapping> = Vec::new();

        for entity in mappable_entities(catalog) {
            let entity_type = entity.entity_type();
            validate_source_id(entity_type, entity.id())?;
            let key = MappingKey::new(entity_type, entity.id());
            if prepared.contains_key(&key) {
                continue;
            }

            let parent_source_id = entity.parent_source_id();
            let parent_mapping_id = match (entity_type.parent_type(), parent_source_id) {
                (Some(parent_type), Some(parent_id)) => {
                    let parent_key = MappingKey::new(parent_type, parent_id);
                    prepared
                        .get(&parent_key)
                        .or_else(|| existing.get(&parent_key))
                        .map(|parent| parent.id.clone())
                }
                _ => None,
            };

            let mapping = self.prepare(
                scope,
                existing.remove(&key),
                entity_type,
                entity.id(),
                entity.name(),
                parent_source_id,
                parent_mapping_id,
                now,
            );
            prepared.insert(key, mapping.clone());
            ordered.push(mapping);
        }

        if ordered.is_empty() {
            return Ok(HashMap::new());
        }

        let count = ordered.len();
        let stored = self.repository.upsert_mappings(ordered).await?;
        debug!(
            "[MenuSync] Bulk mapped {} entities for scope={}",
            count, scope
        );
        Ok(stored.into_iter().map(|m| (m.key(), m)).collect())
    }

    /// Deactivates active mappings of `entity_type` whose source id is absent
    /// from `current_ids`. Mappings are never deleted.
    pub async fn deactivate_obsolete(
        &self,
        scope: &SyncScope,
        current_ids: &HashSet<String>,
        entity_type: EntityType,
    ) -> Result<usize> {
        let obsolete: Vec<ItemMapping> = self
            .repository
            .list_mappings(scope, Some(entity_type))?
            .into_iter()
            .filter(|m| m.is_active && !current_ids.contains(&m.source_id))
            .map(|mut m| {
                m.is_active = false;
                m
            })
            .collect();

        if obsolete.is_empty() {
            return Ok(0);
        }
        let count = obsolete.len();
        self.repository.upsert_mappings(obsolete).await?;
        info!(
            "[MenuSync] Deactivated {} obsolete {} mappings for scope={}",
            count, entity_type, scope
        );
        Ok(count)
    }

    /// Runs [`Self::deactivate_obsolete`] for every entity type against the
    /// non-deleted entities of `catalog`.
    pub async fn deactivate_missing_from(&self, scope: &SyncScope, catalog: &Catalog) -> Result<usize> {
        let mut current: HashMap<EntityType, HashSet<String>> = HashMap::new();
        for entity in mappable_entities(catalog) {
            current
                .entry(entity.entity_type())
                .or_default()
                .insert(entity.id().to_string());
        }
        let mut total = 0;
        for entity_type in EntityType::ALL {
            let ids = current.remove(&entity_type).unwrap_or_default();
            total += self.deactivate_obsolete(scope, &ids, entity_type).await?;
        }
        Ok(total)
    }

    /// Stamps the mappings as delivered downstream.
    pub async fn mark_synced(&self, mapping_ids: Vec<String>) -> Result<usize> {
        if mapping_ids.is_empty() {
            return Ok(0);
        }
        self.repository.mark_synced(mapping_ids, Utc::now()).await
    }

    /// Consistency sweep over one scope.
    ///
    /// Duplicate active remote codes keep the most recently verified mapping
    /// and deactivate the rest. Parent references pointing at missing rows are
    /// cleared. Children whose parent mapping exists by now are relinked.
    pub async fn validate_and_fix(&self, scope: &SyncScope) -> Result<MappingRepairReport> {
        let mappings = self.repository.list_mappings(scope, None)?;
        let mut report = MappingRepairReport {
            scanned: mappings.len(),
            ..Default::default()
        };

        let by_id: HashSet<&str> = mappings.iter().map(|m| m.id.as_str()).collect();
        let by_key: HashMap<MappingKey, &ItemMapping> =
            mappings.iter().map(|m| (m.key(), m)).collect();
        let mut changed: HashMap<String, ItemMapping> = HashMap::new();

        let mut by_code: HashMap<&str, Vec<&ItemMapping>> = HashMap::new();
        for mapping in mappings.iter().filter(|m| m.is_active) {
            by_code.entry(mapping.remote_code.as_str()).or_default().push(mapping);
        }
        for (code, mut group) in by_code.into_iter().filter(|(_, g)| g.len() > 1) {
            report.duplicate_codes += 1;
            group.sort_by(|a, b| {
                b.last_verified_at
                    .cmp(&a.last_verified_at)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            });
            warn!(
                "[MenuSync] Remote code {} shared by {} mappings in scope={}, keeping {}",
                code,
                group.len(),
                scope,
                group[0].id
            );
            for duplicate in group.into_iter().skip(1) {
                let mut fixed = duplicate.clone();
                fixed.is_active = false;
                changed.insert(fixed.id.clone(), fixed);
                report.deactivated_duplicates += 1;
            }
        }

        for mapping in &mappings {
            let mut fixed = changed
                .get(&mapping.id)
                .cloned()
                .unwrap_or_else(|| mapping.clone());
            let mut touched = false;

            if let Some(parent_id) = fixed.parent_mapping_id.as_deref() {
                if !by_id.contains(parent_id) {
                    fixed.parent_mapping_id = None;
                    report.orphans_cleared += 1;
                    touched = true;
                }
            }

            if fixed.parent_mapping_id.is_none() {
                if let (Some(parent_type), Some(parent_source)) =
                    (fixed.entity_type.parent_type(), fixed.parent_source_id.as_deref())
                {
                    if let Some(parent) = by_key.get(&MappingKey::new(parent_type, parent_source)) {
                        fixed.parent_mapping_id = Some(parent.id.clone());
                        report.relinked += 1;
                        touched = true;
                    }
                }
            }

            if touched {
                changed.insert(fixed.id.clone(), fixed);
            }
        }

        if !changed.is_empty() {
            self.repository
                .upsert_mappings(changed.into_values().collect())
                .await?;
        }
        if !report.is_clean() {
            info!("[MenuSync] Mapping repair for scope={}: {:?}", scope, report);
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        scope: &SyncScope,
        existing: Option<ItemMapping>,
        entity_type: EntityType,
        source_id: &str,
        name: &str,
        parent_source_id: Option<&str>,
        parent_mapping_id: Option<String>,
        now: DateTime<Utc>,
    ) -> ItemMapping {
        match existing {
            Some(mut mapping) => {
                mapping.name = name.to_string();
                mapping.is_active = true;
                mapping.parent_source_id = parent_source_id.map(str::to_string);
                mapping.parent_mapping_id = parent_mapping_id;
                mapping.last_verified_at = now;
                mapping
            }
            None => ItemMapping {
                id: Uuid::now_v7().to_string(),
                scope: scope.clone(),
                entity_type,
                source_id: source_id.to_string(),
                remote_code: self.remote_code_for(scope, entity_type, source_id),
                remote_internal_id: None,
                parent_mapping_id,
                parent_source_id: parent_source_id.map(str::to_string),
                name: name.to_string(),
                is_active: true,
                sync_count: 0,
                created_at: now,
                last_verified_at: now,
                last_synced_at: None,
            },
        }
    }
}

fn validate_source_id(entity_type: EntityType, source_id: &str) -> Result<()> {
    if source_id.trim().is_empty() {
        return Err(Error::validation(format!(
            "Cannot map a {} with an empty source id",
            entity_type
        )));
    }
    Ok(())
}

/// Catalog entities that hold a mapping, parents first.
fn mappable_entities(catalog: &Catalog) -> Vec<CatalogEntity> {
    let mut entities = Vec::new();
    for category in catalog.categories.iter().filter(|c| !c.is_deleted) {
        entities.push(CatalogEntity::Category(category.clone()));
    }
    for modifier in catalog.modifiers.iter().filter(|m| !m.is_deleted) {
        entities.push(CatalogEntity::Modifier(modifier.clone()));
    }
    for modifier in catalog.modifiers.iter().filter(|m| !m.is_deleted) {
        for option in modifier.options.iter().filter(|o| !o.is_deleted) {
            entities.push(CatalogEntity::ModifierOption {
                modifier_id: modifier.id.clone(),
                option: option.clone(),
            });
        }
    }
    for product in catalog.products.iter().filter(|p| !p.is_deleted) {
        entities.push(CatalogEntity::Product(product.clone()));
    }
    entities
}
