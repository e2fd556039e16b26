//! Contracts of the upstream catalog source and the downstream marketplace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::deltas::DeltaPayload;
use crate::errors::CollaboratorError;
use crate::scope::SyncScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFetchRequest {
    pub scope: SyncScope,
    /// Deleted and inactive entities are needed to detect soft deletes.
    pub include_deleted: bool,
    pub include_inactive: bool,
}

impl CatalogFetchRequest {
    pub fn complete(scope: SyncScope) -> Self {
        Self {
            scope,
            include_deleted: true,
            include_inactive: true,
        }
    }
}

/// Upstream point-of-sale catalog.
///
/// Implementations page internally and return the complete catalog of the
/// request's account and branch. Menu-group filtering happens in the engine.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(
        &self,
        request: &CatalogFetchRequest,
    ) -> Result<Catalog, CollaboratorError>;
}

/// Reply of a delta submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub success: bool,
    pub import_id: Option<String>,
    /// Item-level failures. They do not fail the submission itself.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SubmissionResult {
    pub fn accepted(import_id: impl Into<String>) -> Self {
        Self {
            success: true,
            import_id: Some(import_id.into()),
            errors: Vec::new(),
        }
    }
}

/// Downstream delivery marketplace. A call is all-or-nothing.
#[async_trait]
pub trait DeltaSubmitter: Send + Sync {
    async fn submit_delta(
        &self,
        payload: &DeltaPayload,
        vendor_ref: &str,
        correlation_id: &str,
    ) -> Result<SubmissionResult, CollaboratorError>;

    /// Identifier of the scope on the marketplace side.
    fn vendor_ref(&self, scope: &SyncScope) -> String {
        scope.key()
    }
}
