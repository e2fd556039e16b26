//! Repository for stable item mappings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use menusync_core::catalog::EntityType;
use menusync_core::errors::Result;
use menusync_core::mappings::{ItemMapping, MappingRepositoryTrait};
use menusync_core::SyncScope;

use super::model::ItemMappingDB;
use crate::conversions::{enum_to_db, ts};
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::item_mappings;

pub struct MappingRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl MappingRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        MappingRepository { pool, writer }
    }
}

fn upsert_one(conn: &mut SqliteConnection, mapping: ItemMapping) -> Result<ItemMapping> {
    let mut row = ItemMappingDB::try_from(&mapping)?;
    let existing = item_mappings::table
        .filter(item_mappings::scope_key.eq(&row.scope_key))
        .filter(item_mappings::entity_type.eq(&row.entity_type))
        .filter(item_mappings::source_id.eq(&row.source_id))
        .select(ItemMappingDB::as_select())
        .first(conn)
        .optional()
        .map_err(StorageError::from)?;

    match existing {
        Some(current) => {
            row.id = current.id;
            row.remote_code = current.remote_code;
            row.created_at = current.created_at;
            diesel::update(item_mappings::table.find(&row.id))
                .set(&row)
                .execute(conn)
                .map_err(StorageError::from)?;
        }
        None => {
            diesel::insert_into(item_mappings::table)
                .values(&row)
                .execute(conn)
                .map_err(StorageError::from)?;
        }
    }
    ItemMapping::try_from(row)
}

#[async_trait]
impl MappingRepositoryTrait for MappingRepository {
    fn get_mapping(
        &self,
        scope: &SyncScope,
        entity_type: EntityType,
        source_id: &str,
    ) -> Result<Option<ItemMapping>> {
        let mut conn = get_connection(&self.pool)?;
        item_mappings::table
            .filter(item_mappings::scope_key.eq(scope.key()))
            .filter(item_mappings::entity_type.eq(enum_to_db(&entity_type)?))
            .filter(item_mappings::source_id.eq(source_id))
            .select(ItemMappingDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(ItemMapping::try_from)
            .transpose()
    }

    fn get_mapping_by_id(&self, mapping_id: &str) -> Result<Option<ItemMapping>> {
        let mut conn = get_connection(&self.pool)?;
        item_mappings::table
            .find(mapping_id)
            .select(ItemMappingDB::as_select())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(ItemMapping::try_from)
            .transpose()
    }

    fn list_mappings(
        &self,
        scope: &SyncScope,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<ItemMapping>> {
        let mut conn = get_connection(&self.pool)?;
        let mut query = item_mappings::table
            .filter(item_mappings::scope_key.eq(scope.key()))
            .select(ItemMappingDB::as_select())
            .into_boxed();
        if let Some(entity_type) = entity_type {
            query = query.filter(item_mappings::entity_type.eq(enum_to_db(&entity_type)?));
        }
        query
            .order((item_mappings::entity_type.asc(), item_mappings::source_id.asc()))
            .load(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(ItemMapping::try_from)
            .collect()
    }

    async fn upsert_mappings(&self, mappings: Vec<ItemMapping>) -> Result<Vec<ItemMapping>> {
        if mappings.is_empty() {
            return Ok(Vec::new());
        }
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<Vec<ItemMapping>> {
                let mut stored = Vec::with_capacity(mappings.len());
                for mapping in mappings {
                    stored.push(upsert_one(conn, mapping)?);
                }
                Ok(stored)
            })
            .await
    }

    async fn mark_synced(
        &self,
        mapping_ids: Vec<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<usize> {
        if mapping_ids.is_empty() {
            return Ok(0);
        }
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(
                    diesel::update(item_mappings::table.filter(item_mappings::id.eq_any(mapping_ids)))
                        .set((
                            item_mappings::last_synced_at.eq(Some(ts(&synced_at))),
                            item_mappings::sync_count.eq(item_mappings::sync_count + 1),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?,
                )
            })
            .await
    }
}
