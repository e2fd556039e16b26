//! Deterministic downstream codes.
//!
//! A remote code depends only on the entity type, the upstream id and
//! (when partitioning is enabled) the scope's menu group. It never reads
//! clocks, counters or storage, so every process derives the same code.

use crate::catalog::{sha256_hex, EntityType};
use crate::scope::SyncScope;

const PARTITION_SUFFIX_LEN: usize = 8;

pub fn remote_code_prefix(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Product => "PRD",
        EntityType::Category => "CAT",
        EntityType::Modifier => "MOD",
        EntityType::ModifierOption => "OPT",
    }
}

/// Builds `{PREFIX}_{sourceId}`, suffixed with `_{8 hex}` of the menu group
/// id when `partition_by_menu_group` is set and the scope has a group.
pub fn remote_code(
    entity_type: EntityType,
    source_id: &str,
    scope: &SyncScope,
    partition_by_menu_group: bool,
) -> String {
    let base = format!("{}_{}", remote_code_prefix(entity_type), source_id.trim());
    match scope.menu_group_id.as_deref() {
        Some(group) if partition_by_menu_group => {
            let digest = sha256_hex(group.as_bytes());
            format!("{}_{}", base, &digest[..PARTITION_SUFFIX_LEN])
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_prefix_and_source_id() {
        let scope = SyncScope::account("acc-1");
        assert_eq!(remote_code(EntityType::Product, "123", &scope, false), "PRD_123");
        assert_eq!(remote_code(EntityType::Category, "c-9", &scope, false), "CAT_c-9");
        assert_eq!(remote_code(EntityType::Modifier, "m", &scope, false), "MOD_m");
        assert_eq!(remote_code(EntityType::ModifierOption, "o", &scope, false), "OPT_o");
    }

    #[test]
    fn code_is_deterministic() {
        let scope = SyncScope::account("acc-1").with_menu_group("lunch");
        let first = remote_code(EntityType::Product, "p1", &scope, true);
        let second = remote_code(EntityType::Product, "p1", &scope.clone(), true);
        assert_eq!(first, second);
        // sha256("lunch") starts with this prefix in every process.
        assert_eq!(first, format!("PRD_p1_{}", &sha256_hex(b"lunch")[..8]));
    }

    #[test]
    fn partitioning_separates_menu_groups() {
        let lunch = SyncScope::account("acc-1").with_menu_group("lunch");
        let dinner = SyncScope::account("acc-1").with_menu_group("dinner");
        assert_ne!(
            remote_code(EntityType::Product, "p1", &lunch, true),
            remote_code(EntityType::Product, "p1", &dinner, true)
        );
        assert_eq!(
            remote_code(EntityType::Product, "p1", &lunch, false),
            remote_code(EntityType::Product, "p1", &dinner, false)
        );
    }

    #[test]
    fn partitioning_without_group_keeps_plain_code() {
        let scope = SyncScope::account("acc-1");
        assert_eq!(remote_code(EntityType::Product, "p1", &scope, true), "PRD_p1");
    }
}
