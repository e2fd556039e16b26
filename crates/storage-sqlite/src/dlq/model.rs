use diesel::prelude::*;

use menusync_core::dlq::DeadLetterEntry;
use menusync_core::errors::{Error, Result};

use crate::conversions::{
    enum_from_db, enum_to_db, json_from_db, json_to_db, parse_ts, parse_ts_opt,
    scope_from_columns, ts, ts_opt, ScopeColumns,
};

/// Dead letter row. `priority_rank` mirrors `priority` so it can be range-filtered.
#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::dead_letters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeadLetterDB {
    pub id: String,
    pub correlation_id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub sync_run_id: Option<String>,
    pub operation: String,
    pub payload: String,
    pub error_code: String,
    pub error_message: String,
    pub failure_type: String,
    pub attempt_count: i32,
    pub priority: String,
    pub priority_rank: i32,
    pub context: String,
    pub created_at: String,
    pub replayed_by_run_id: Option<String>,
    pub replayed_at: Option<String>,
}

impl TryFrom<&DeadLetterEntry> for DeadLetterDB {
    type Error = Error;

    fn try_from(entry: &DeadLetterEntry) -> Result<Self> {
        let scope = ScopeColumns::from(&entry.scope);
        Ok(Self {
            id: entry.id.clone(),
            correlation_id: entry.correlation_id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            sync_run_id: entry.sync_run_id.clone(),
            operation: entry.payload.operation().to_string(),
            payload: json_to_db(&entry.payload)?,
            error_code: entry.error_code.clone(),
            error_message: entry.error_message.clone(),
            failure_type: enum_to_db(&entry.failure_type)?,
            attempt_count: entry.attempt_count,
            priority: enum_to_db(&entry.priority)?,
            priority_rank: entry.priority as i32,
            context: json_to_db(&entry.context)?,
            created_at: ts(&entry.created_at),
            replayed_by_run_id: entry.replayed_by_run_id.clone(),
            replayed_at: ts_opt(entry.replayed_at.as_ref()),
        })
    }
}

impl TryFrom<DeadLetterDB> for DeadLetterEntry {
    type Error = Error;

    fn try_from(row: DeadLetterDB) -> Result<Self> {
        Ok(DeadLetterEntry {
            id: row.id,
            correlation_id: row.correlation_id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            sync_run_id: row.sync_run_id,
            payload: json_from_db(&row.payload)?,
            error_code: row.error_code,
            error_message: row.error_message,
            failure_type: enum_from_db(&row.failure_type)?,
            attempt_count: row.attempt_count,
            priority: enum_from_db(&row.priority)?,
            context: json_from_db(&row.context)?,
            created_at: parse_ts(&row.created_at)?,
            replayed_by_run_id: row.replayed_by_run_id,
            replayed_at: parse_ts_opt(row.replayed_at.as_deref())?,
        })
    }
}
