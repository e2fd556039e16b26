use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::EntityType;
use crate::errors::Result;
use crate::scope::SyncScope;

use super::mapping_model::ItemMapping;

/// Persistence contract for item mappings.
#[async_trait]
pub trait MappingRepositoryTrait: Send + Sync {
    fn get_mapping(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<ItemMapping>>;

    fn get_mapping_by_id(&self, mapping_id: &str) -> Result<Option<ItemMapping>>;

    /// All mappings of the scope, optionally restricted to one entity type.
    fn list_mappings(
        &self,
        scope: &SyncScope,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<ItemMapping>>;

    /// Inserts or updates by `(scope, entity_type, source_id)`.
    ///
    /// An existing row keeps its id, remote code and creation time; every
    /// other field is overwritten. Returns the stored rows.
    async fn upsert_mappings(&self, mappings: Vec<ItemMapping>) -> Result<Vec<ItemMapping>>;

    /// Stamps `last_synced_at` and increments `sync_count`.
    async fn mark_synced(
        &self,
        mapping_ids: Vec<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<usize>;
}
