use diesel::prelude::*;

use menusync_core::errors::{Error, Result};
use menusync_core::mappings::ItemMapping;

use crate::conversions::{
    enum_from_db, enum_to_db, parse_ts, parse_ts_opt, scope_from_columns, ts, ts_opt,
    ScopeColumns,
};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::item_mappings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct ItemMappingDB {
    pub id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub entity_type: String,
    pub source_id: String,
    pub remote_code: String,
    pub remote_internal_id: Option<String>,
    pub parent_mapping_id: Option<String>,
    pub parent_source_id: Option<String>,
    pub name: String,
    pub is_active: bool,
    pub sync_count: i64,
    pub created_at: String,
    pub last_verified_at: String,
    pub last_synced_at: Option<String>,
}

impl TryFrom<&ItemMapping> for ItemMappingDB {
    type Error = Error;

    fn try_from(mapping: &ItemMapping) -> Result<Self> {
        let scope = ScopeColumns::from(&mapping.scope);
        Ok(Self {
            id: mapping.id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            entity_type: enum_to_db(&mapping.entity_type)?,
            source_id: mapping.source_id.clone(),
            remote_code: mapping.remote_code.clone(),
            remote_internal_id: mapping.remote_internal_id.clone(),
            parent_mapping_id: mapping.parent_mapping_id.clone(),
            parent_source_id: mapping.parent_source_id.clone(),
            name: mapping.name.clone(),
            is_active: mapping.is_active,
            sync_count: mapping.sync_count,
            created_at: ts(&mapping.created_at),
            last_verified_at: ts(&mapping.last_verified_at),
            last_synced_at: ts_opt(mapping.last_synced_at.as_ref()),
        })
    }
}

impl TryFrom<ItemMappingDB> for ItemMapping {
    type Error = Error;

    fn try_from(row: ItemMappingDB) -> Result<Self> {
        Ok(ItemMapping {
            id: row.id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            entity_type: enum_from_db(&row.entity_type)?,
            source_id: row.source_id,
            remote_code: row.remote_code,
            remote_internal_id: row.remote_internal_id,
            parent_mapping_id: row.parent_mapping_id,
            parent_source_id: row.parent_source_id,
            name: row.name,
            is_active: row.is_active,
            sync_count: row.sync_count,
            created_at: parse_ts(&row.created_at)?,
            last_verified_at: parse_ts(&row.last_verified_at)?,
            last_synced_at: parse_ts_opt(row.last_synced_at.as_deref())?,
        })
    }
}
