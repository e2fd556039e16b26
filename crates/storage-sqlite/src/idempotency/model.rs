use diesel::prelude::*;

use menusync_core::errors::{Error, Result};
use menusync_core::idempotency::IdempotencyRecord;

use crate::conversions::{
    enum_from_db, enum_to_db, parse_ts, parse_ts_opt, scope_from_columns, ts, ts_opt,
    ScopeColumns,
};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::idempotency_records)]
#[diesel(primary_key(key))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct IdempotencyRecordDB {
    pub key: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub kind: String,
    pub status: String,
    pub owner_id: String,
    pub version: i64,
    pub attempt_count: i32,
    pub started_at: String,
    pub heartbeat_at: String,
    pub completed_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<&IdempotencyRecord> for IdempotencyRecordDB {
    type Error = Error;

    fn try_from(record: &IdempotencyRecord) -> Result<Self> {
        let scope = ScopeColumns::from(&record.scope);
        Ok(Self {
            key: record.key.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            kind: enum_to_db(&record.kind)?,
            status: enum_to_db(&record.status)?,
            owner_id: record.owner_id.clone(),
            version: record.version,
            attempt_count: record.attempt_count,
            started_at: ts(&record.started_at),
            heartbeat_at: ts(&record.heartbeat_at),
            completed_at: ts_opt(record.completed_at.as_ref()),
            last_error: record.last_error.clone(),
            created_at: ts(&record.created_at),
            updated_at: ts(&record.updated_at),
        })
    }
}

impl TryFrom<IdempotencyRecordDB> for IdempotencyRecord {
    type Error = Error;

    fn try_from(row: IdempotencyRecordDB) -> Result<Self> {
        Ok(IdempotencyRecord {
            key: row.key,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            kind: enum_from_db(&row.kind)?,
            status: enum_from_db(&row.status)?,
            owner_id: row.owner_id,
            version: row.version,
            attempt_count: row.attempt_count,
            started_at: parse_ts(&row.started_at)?,
            heartbeat_at: parse_ts(&row.heartbeat_at)?,
            completed_at: parse_ts_opt(row.completed_at.as_deref())?,
            last_error: row.last_error,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}
