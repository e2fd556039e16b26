//! Sync scope: the (account, branch, menu-group) key partitioning all versioning state.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Placeholder used in the flattened scope key for an absent branch or group.
const ABSENT_SEGMENT: &str = "-";

/// Explicit tenant scope threaded through every engine call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncScope {
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
}

impl SyncScope {
    pub fn new(
        account_id: impl Into<String>,
        branch_id: Option<String>,
        menu_group_id: Option<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            branch_id: branch_id.filter(|v| !v.trim().is_empty()),
            menu_group_id: menu_group_id.filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn account(account_id: impl Into<String>) -> Self {
        Self::new(account_id, None, None)
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn with_menu_group(mut self, menu_group_id: impl Into<String>) -> Self {
        self.menu_group_id = Some(menu_group_id.into());
        self
    }

    /// Flattened, stable key used for storage filtering and idempotency keys.
    ///
    /// Format: `{account}|{branch or -}|{group or -}`.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.account_id,
            self.branch_id.as_deref().unwrap_or(ABSENT_SEGMENT),
            self.menu_group_id.as_deref().unwrap_or(ABSENT_SEGMENT)
        )
    }

    /// Parses a key produced by [`SyncScope::key`].
    pub fn from_key(key: &str) -> Result<Self> {
        let mut parts = key.splitn(3, '|');
        let (Some(account), Some(branch), Some(group)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::validation(format!("Malformed scope key '{}'", key)));
        };
        let segment = |value: &str| (value != ABSENT_SEGMENT).then(|| value.to_string());
        let scope = Self::new(account, segment(branch), segment(group));
        scope.validate()?;
        Ok(scope)
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(Error::validation("Scope account id must not be empty"));
        }
        for segment in [
            Some(self.account_id.as_str()),
            self.branch_id.as_deref(),
            self.menu_group_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if segment.contains('|') || segment == ABSENT_SEGMENT {
                return Err(Error::validation(format!(
                    "Scope segment '{}' is not allowed",
                    segment
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}
