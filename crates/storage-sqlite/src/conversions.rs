//! Column conversions shared by the repositories.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use menusync_core::errors::Result;
use menusync_core::utils::time_utils::{
    parse_optional_timestamp, parse_storage_timestamp, to_storage_timestamp,
};
use menusync_core::SyncScope;

/// Text form of a unit enum, as serde renders it.
pub(crate) fn enum_to_db<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

pub(crate) fn optional_enum_to_db<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(enum_to_db).transpose()
}

pub(crate) fn optional_enum_from_db<T: DeserializeOwned>(value: Option<&str>) -> Result<Option<T>> {
    value.map(enum_from_db).transpose()
}

pub(crate) fn json_to_db<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn json_from_db<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(value)?)
}

pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    to_storage_timestamp(value)
}

pub(crate) fn ts_opt(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(to_storage_timestamp)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    parse_storage_timestamp(value)
}

pub(crate) fn parse_ts_opt(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    parse_optional_timestamp(value)
}

/// The four scope columns every scoped table carries.
#[derive(Debug, Clone)]
pub(crate) struct ScopeColumns {
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
}

impl From<&SyncScope> for ScopeColumns {
    fn from(scope: &SyncScope) -> Self {
        Self {
            scope_key: scope.key(),
            account_id: scope.account_id.clone(),
            branch_id: scope.branch_id.clone(),
            menu_group_id: scope.menu_group_id.clone(),
        }
    }
}

pub(crate) fn scope_from_columns(
    account_id: String,
    branch_id: Option<String>,
    menu_group_id: Option<String>,
) -> SyncScope {
    SyncScope::new(account_id, branch_id, menu_group_id)
}
