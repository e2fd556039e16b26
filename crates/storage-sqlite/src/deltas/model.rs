use diesel::prelude::*;

use menusync_core::deltas::{Delta, ItemDeletion};
use menusync_core::errors::{Error, Result};

use crate::conversions::{
    enum_from_db, enum_to_db, json_from_db, json_to_db, parse_ts, parse_ts_opt,
    scope_from_columns, ts, ts_opt, ScopeColumns,
};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::menu_deltas)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct MenuDeltaDB {
    pub id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub source_snapshot_id: Option<String>,
    pub source_version: Option<i64>,
    pub target_snapshot_id: String,
    pub target_version: i64,
    pub delta_type: String,
    pub added_count: i64,
    pub updated_count: i64,
    pub removed_count: i64,
    pub soft_deleted_count: i64,
    pub payload: Option<Vec<u8>>,
    pub sync_status: String,
    pub retry_count: i32,
    pub sync_run_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TryFrom<&Delta> for MenuDeltaDB {
    type Error = Error;

    fn try_from(delta: &Delta) -> Result<Self> {
        let scope = ScopeColumns::from(&delta.scope);
        Ok(Self {
            id: delta.id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            source_snapshot_id: delta.source_snapshot_id.clone(),
            source_version: delta.source_version,
            target_snapshot_id: delta.target_snapshot_id.clone(),
            target_version: delta.target_version,
            delta_type: enum_to_db(&delta.delta_type)?,
            added_count: delta.added_count,
            updated_count: delta.updated_count,
            removed_count: delta.removed_count,
            soft_deleted_count: delta.soft_deleted_count,
            payload: delta.payload.clone(),
            sync_status: enum_to_db(&delta.sync_status)?,
            retry_count: delta.retry_count,
            sync_run_id: delta.sync_run_id.clone(),
            last_error: delta.last_error.clone(),
            created_at: ts(&delta.created_at),
            updated_at: ts(&delta.updated_at),
            completed_at: ts_opt(delta.completed_at.as_ref()),
        })
    }
}

impl TryFrom<MenuDeltaDB> for Delta {
    type Error = Error;

    fn try_from(row: MenuDeltaDB) -> Result<Self> {
        Ok(Delta {
            id: row.id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            source_snapshot_id: row.source_snapshot_id,
            source_version: row.source_version,
            target_snapshot_id: row.target_snapshot_id,
            target_version: row.target_version,
            delta_type: enum_from_db(&row.delta_type)?,
            added_count: row.added_count,
            updated_count: row.updated_count,
            removed_count: row.removed_count,
            soft_deleted_count: row.soft_deleted_count,
            payload: row.payload,
            sync_status: enum_from_db(&row.sync_status)?,
            retry_count: row.retry_count,
            sync_run_id: row.sync_run_id,
            last_error: row.last_error,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
            completed_at: parse_ts_opt(row.completed_at.as_deref())?,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::item_deletions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct ItemDeletionDB {
    pub id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub entity_type: String,
    pub source_id: String,
    pub remote_code: String,
    pub name: String,
    pub reason: String,
    pub source: String,
    pub entity_snapshot: String,
    pub delta_id: Option<String>,
    pub snapshot_version: Option<i64>,
    pub sync_status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub synced_at: Option<String>,
    pub expires_at: String,
}

impl TryFrom<&ItemDeletion> for ItemDeletionDB {
    type Error = Error;

    fn try_from(deletion: &ItemDeletion) -> Result<Self> {
        let scope = ScopeColumns::from(&deletion.scope);
        Ok(Self {
            id: deletion.id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            entity_type: enum_to_db(&deletion.entity_type)?,
            source_id: deletion.source_id.clone(),
            remote_code: deletion.remote_code.clone(),
            name: deletion.name.clone(),
            reason: deletion.reason.as_str().to_string(),
            source: deletion.source.as_str().to_string(),
            entity_snapshot: json_to_db(&deletion.entity_snapshot)?,
            delta_id: deletion.delta_id.clone(),
            snapshot_version: deletion.snapshot_version,
            sync_status: deletion.sync_status.as_str().to_string(),
            retry_count: deletion.retry_count,
            last_error: deletion.last_error.clone(),
            created_at: ts(&deletion.created_at),
            synced_at: ts_opt(deletion.synced_at.as_ref()),
            expires_at: ts(&deletion.expires_at),
        })
    }
}

impl TryFrom<ItemDeletionDB> for ItemDeletion {
    type Error = Error;

    fn try_from(row: ItemDeletionDB) -> Result<Self> {
        Ok(ItemDeletion {
            id: row.id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            entity_type: enum_from_db(&row.entity_type)?,
            source_id: row.source_id,
            remote_code: row.remote_code,
            name: row.name,
            reason: enum_from_db(&row.reason)?,
            source: enum_from_db(&row.source)?,
            entity_snapshot: json_from_db(&row.entity_snapshot)?,
            delta_id: row.delta_id,
            snapshot_version: row.snapshot_version,
            sync_status: enum_from_db(&row.sync_status)?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: parse_ts(&row.created_at)?,
            synced_at: parse_ts_opt(row.synced_at.as_deref())?,
            expires_at: parse_ts(&row.expires_at)?,
        })
    }
}
