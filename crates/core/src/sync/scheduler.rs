//! Entry point called by whatever schedules syncs.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;
use crate::scope::SyncScope;

use super::orchestrator::SyncOrchestrator;
use super::sync_model::{RunSyncRequest, SyncReport};

/// Passive trigger surface. The engine knows nothing about cadence, queues
/// or distribution; callers invoke `run_sync` once per scope.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn run_sync(
        &self,
        account_id: &str,
        branch_id: Option<&str>,
        menu_group_id: Option<&str>,
        force_full: bool,
    ) -> Result<SyncReport>;
}

#[async_trait]
impl SyncTrigger for SyncOrchestrator {
    async fn run_sync(
        &self,
        account_id: &str,
        branch_id: Option<&str>,
        menu_group_id: Option<&str>,
        force_full: bool,
    ) -> Result<SyncReport> {
        let scope = SyncScope::new(
            account_id,
            branch_id.map(str::to_string),
            menu_group_id.map(str::to_string),
        );
        let request = RunSyncRequest::scheduled(scope).with_force_full(force_full);
        self.run(request, &CancellationToken::new()).await
    }
}
