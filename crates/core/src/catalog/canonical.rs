//! Canonical catalog normalization and content hashing.
//!
//! The canonical form sorts every entity list by id, sorts id sets, and
//! normalizes decimal scale, so the hash is independent of the order in
//! which the upstream source returned items.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

use super::catalog_model::{Catalog, EntityType};

/// Bumped whenever the canonical encoding changes; part of every hash.
const CANONICAL_FORMAT: &[u8] = b"menu-catalog/v1\n";

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Checksum string in the `sha256:<hex>` form used for content hashes.
pub fn sha256_checksum(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

pub fn is_valid_content_hash(value: &str) -> bool {
    let Some(hex) = value.strip_prefix("sha256:") else {
        return false;
    };
    hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

fn check_ids<'a>(
    entity_type: EntityType,
    ids: impl Iterator<Item = &'a str>,
    seen: &mut HashSet<&'a str>,
) -> Result<()> {
    for id in ids {
        if id.trim().is_empty() {
            return Err(Error::validation(format!(
                "Catalog contains a {} with an empty id",
                entity_type
            )));
        }
        if !seen.insert(id) {
            return Err(Error::validation(format!(
                "Catalog contains duplicate {} id '{}'",
                entity_type, id
            )));
        }
    }
    Ok(())
}

/// Rejects catalogs whose ids cannot be used as stable keys.
///
/// Option ids must be unique across the whole catalog because options are
/// mapped and diffed independently of their modifier.
pub fn validate_catalog(catalog: &Catalog) -> Result<()> {
    check_ids(
        EntityType::Product,
        catalog.products.iter().map(|p| p.id.as_str()),
        &mut HashSet::new(),
    )?;
    check_ids(
        EntityType::Category,
        catalog.categories.iter().map(|c| c.id.as_str()),
        &mut HashSet::new(),
    )?;
    check_ids(
        EntityType::Modifier,
        catalog.modifiers.iter().map(|m| m.id.as_str()),
        &mut HashSet::new(),
    )?;
    check_ids(
        EntityType::ModifierOption,
        catalog
            .modifiers
            .iter()
            .flat_map(|m| m.options.iter().map(|o| o.id.as_str())),
        &mut HashSet::new(),
    )?;
    Ok(())
}

/// Returns the canonical, order-independent copy of `catalog`.
pub fn normalize(catalog: &Catalog) -> Result<Catalog> {
    validate_catalog(catalog)?;

    let mut normalized = catalog.clone();

    for product in &mut normalized.products {
        product.price = product.price.normalize();
        product.modifier_ids.sort();
        product.modifier_ids.dedup();
        product.menu_group_ids.sort();
        product.menu_group_ids.dedup();
    }
    normalized.products.sort_by(|a, b| a.id.cmp(&b.id));

    normalized.categories.sort_by(|a, b| a.id.cmp(&b.id));

    for modifier in &mut normalized.modifiers {
        for option in &mut modifier.options {
            option.price = option.price.normalize();
        }
        modifier.options.sort_by(|a, b| a.id.cmp(&b.id));
    }
    normalized.modifiers.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(normalized)
}

/// Serialized canonical representation that the content hash is computed over.
pub fn canonical_bytes(catalog: &Catalog) -> Result<Vec<u8>> {
    let normalized = normalize(catalog)?;
    let mut bytes = CANONICAL_FORMAT.to_vec();
    bytes.extend(serde_json::to_vec(&normalized)?);
    Ok(bytes)
}

/// Content hash of the normalized catalog, `sha256:<hex>`.
pub fn content_hash(catalog: &Catalog) -> Result<String> {
    Ok(sha256_checksum(&canonical_bytes(catalog)?))
}
