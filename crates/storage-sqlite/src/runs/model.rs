use diesel::prelude::*;

use menusync_core::errors::{Error, Result};
use menusync_core::runs::{SyncRun, SyncRunStep};

use crate::conversions::{
    enum_from_db, enum_to_db, json_from_db, json_to_db, optional_enum_from_db,
    optional_enum_to_db, parse_ts, parse_ts_opt, scope_from_columns, ts, ts_opt, ScopeColumns,
};

/// Run row; counters, submission info, errors and warnings are JSON text.
#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct SyncRunDB {
    pub id: String,
    pub correlation_id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub sync_type: String,
    pub trigger_source: String,
    pub initiated_by: Option<String>,
    pub status: String,
    pub current_phase: Option<String>,
    pub progress_percentage: i32,
    pub counters: String,
    pub outcome: Option<String>,
    pub submission: Option<String>,
    pub errors: String,
    pub warnings: String,
    pub failure_type: Option<String>,
    pub parent_run_id: Option<String>,
    pub retry_count: i32,
    pub can_retry: bool,
    pub step_count: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub updated_at: String,
}

impl TryFrom<&SyncRun> for SyncRunDB {
    type Error = Error;

    fn try_from(run: &SyncRun) -> Result<Self> {
        let scope = ScopeColumns::from(&run.scope);
        Ok(Self {
            id: run.id.clone(),
            correlation_id: run.correlation_id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            sync_type: enum_to_db(&run.sync_type)?,
            trigger_source: enum_to_db(&run.trigger_source)?,
            initiated_by: run.initiated_by.clone(),
            status: enum_to_db(&run.status)?,
            current_phase: optional_enum_to_db(run.current_phase.as_ref())?,
            progress_percentage: run.progress_percentage,
            counters: json_to_db(&run.counters)?,
            outcome: optional_enum_to_db(run.outcome.as_ref())?,
            submission: run.submission.as_ref().map(json_to_db).transpose()?,
            errors: json_to_db(&run.errors)?,
            warnings: json_to_db(&run.warnings)?,
            failure_type: optional_enum_to_db(run.failure_type.as_ref())?,
            parent_run_id: run.parent_run_id.clone(),
            retry_count: run.retry_count,
            can_retry: run.can_retry,
            step_count: run.step_count,
            created_at: ts(&run.created_at),
            started_at: ts_opt(run.started_at.as_ref()),
            completed_at: ts_opt(run.completed_at.as_ref()),
            duration_ms: run.duration_ms,
            updated_at: ts(&run.updated_at),
        })
    }
}

impl TryFrom<SyncRunDB> for SyncRun {
    type Error = Error;

    fn try_from(row: SyncRunDB) -> Result<Self> {
        Ok(SyncRun {
            id: row.id,
            correlation_id: row.correlation_id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            sync_type: enum_from_db(&row.sync_type)?,
            trigger_source: enum_from_db(&row.trigger_source)?,
            initiated_by: row.initiated_by,
            status: enum_from_db(&row.status)?,
            current_phase: optional_enum_from_db(row.current_phase.as_deref())?,
            progress_percentage: row.progress_percentage,
            counters: json_from_db(&row.counters)?,
            outcome: optional_enum_from_db(row.outcome.as_deref())?,
            submission: row.submission.as_deref().map(json_from_db).transpose()?,
            errors: json_from_db(&row.errors)?,
            warnings: json_from_db(&row.warnings)?,
            failure_type: optional_enum_from_db(row.failure_type.as_deref())?,
            parent_run_id: row.parent_run_id,
            retry_count: row.retry_count,
            can_retry: row.can_retry,
            step_count: row.step_count,
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_ts_opt(row.started_at.as_deref())?,
            completed_at: parse_ts_opt(row.completed_at.as_deref())?,
            duration_ms: row.duration_ms,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[derive(Queryable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::sync_run_steps)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncRunStepDB {
    pub run_id: String,
    pub sequence: i64,
    pub step_type: String,
    pub phase: Option<String>,
    pub message: String,
    pub data: Option<String>,
    pub created_at: String,
}

impl TryFrom<&SyncRunStep> for SyncRunStepDB {
    type Error = Error;

    fn try_from(step: &SyncRunStep) -> Result<Self> {
        Ok(Self {
            run_id: step.run_id.clone(),
            sequence: step.sequence,
            step_type: enum_to_db(&step.step_type)?,
            phase: optional_enum_to_db(step.phase.as_ref())?,
            message: step.message.clone(),
            data: step.data.as_ref().map(json_to_db).transpose()?,
            created_at: ts(&step.created_at),
        })
    }
}

impl TryFrom<SyncRunStepDB> for SyncRunStep {
    type Error = Error;

    fn try_from(row: SyncRunStepDB) -> Result<Self> {
        Ok(SyncRunStep {
            run_id: row.run_id,
            sequence: row.sequence,
            step_type: enum_from_db(&row.step_type)?,
            phase: optional_enum_from_db(row.phase.as_deref())?,
            message: row.message,
            data: row.data.as_deref().map(json_from_db).transpose()?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}
