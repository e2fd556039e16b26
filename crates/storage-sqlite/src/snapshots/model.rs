use diesel::prelude::*;

use menusync_core::catalog::CatalogCounts;
use menusync_core::errors::{Error, Result};
use menusync_core::snapshots::{CatalogSnapshot, NewCatalogSnapshot};

use crate::conversions::{parse_ts, parse_ts_opt, scope_from_columns, ts, ts_opt, ScopeColumns};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::catalog_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(treat_none_as_null = true)]
pub struct CatalogSnapshotDB {
    pub id: String,
    pub scope_key: String,
    pub account_id: String,
    pub branch_id: Option<String>,
    pub menu_group_id: Option<String>,
    pub version: i64,
    pub content_hash: String,
    pub product_count: i64,
    pub category_count: i64,
    pub modifier_count: i64,
    pub modifier_option_count: i64,
    pub payload: Option<Vec<u8>>,
    pub is_submitted: bool,
    pub import_id: Option<String>,
    pub vendor_ref: Option<String>,
    pub submitted_at: Option<String>,
    pub created_at: String,
}

impl From<&CatalogSnapshot> for CatalogSnapshotDB {
    fn from(snapshot: &CatalogSnapshot) -> Self {
        let scope = ScopeColumns::from(&snapshot.scope);
        Self {
            id: snapshot.id.clone(),
            scope_key: scope.scope_key,
            account_id: scope.account_id,
            branch_id: scope.branch_id,
            menu_group_id: scope.menu_group_id,
            version: snapshot.version,
            content_hash: snapshot.content_hash.clone(),
            product_count: snapshot.counts.products,
            category_count: snapshot.counts.categories,
            modifier_count: snapshot.counts.modifiers,
            modifier_option_count: snapshot.counts.modifier_options,
            payload: snapshot.payload.clone(),
            is_submitted: snapshot.is_submitted,
            import_id: snapshot.import_id.clone(),
            vendor_ref: snapshot.vendor_ref.clone(),
            submitted_at: ts_opt(snapshot.submitted_at.as_ref()),
            created_at: ts(&snapshot.created_at),
        }
    }
}

impl From<NewCatalogSnapshot> for CatalogSnapshotDB {
    fn from(snapshot: NewCatalogSnapshot) -> Self {
        Self::from(&snapshot.into_snapshot())
    }
}

impl TryFrom<CatalogSnapshotDB> for CatalogSnapshot {
    type Error = Error;

    fn try_from(row: CatalogSnapshotDB) -> Result<Self> {
        Ok(CatalogSnapshot {
            id: row.id,
            scope: scope_from_columns(row.account_id, row.branch_id, row.menu_group_id),
            version: row.version,
            content_hash: row.content_hash,
            counts: CatalogCounts {
                products: row.product_count,
                categories: row.category_count,
                modifiers: row.modifier_count,
                modifier_options: row.modifier_option_count,
            },
            payload: row.payload,
            is_submitted: row.is_submitted,
            import_id: row.import_id,
            vendor_ref: row.vendor_ref,
            submitted_at: parse_ts_opt(row.submitted_at.as_deref())?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}
