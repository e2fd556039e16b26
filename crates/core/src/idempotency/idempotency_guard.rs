//! Keyed lock/ledger preventing duplicate or concurrent execution.
//!
//! Every transition is a read, a decision and a compare-and-set on the
//! record version, so for one key at most one caller can move the record
//! into `InProgress` at a time. A holder that stops heartbeating for the
//! stale window loses its lease and the key can be reclaimed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::scope::SyncScope;

use super::idempotency_model::{
    ClaimDecision, ClaimOutcome, ClaimPolicy, IdempotencyKind, IdempotencyLease,
    IdempotencyRecord, IdempotencyStatus,
};
use super::idempotency_traits::IdempotencyRepositoryTrait;

const MAX_CAS_ATTEMPTS: usize = 5;
const MAX_ERROR_LEN: usize = 1000;

/// Job key: scope plus the coarse time bucket `now` falls into.
pub fn job_key(scope: &SyncScope, now: DateTime<Utc>, bucket_secs: i64) -> String {
    let bucket = now.timestamp().div_euclid(bucket_secs.max(1));
    format!("sync-job:{}:{}", scope.key(), bucket)
}

/// Content key: scope, the baseline the change is relative to, and the hash
/// of the fetched catalog. Forced full runs get their own key.
pub fn content_key(
    scope: &SyncScope,
    baseline_version: Option<i64>,
    content_hash: &str,
    full: bool,
) -> String {
    let mut key = format!(
        "sync-content:{}:v{}:{}",
        scope.key(),
        baseline_version.unwrap_or(0),
        content_hash
    );
    if full {
        key.push_str(":full");
    }
    key
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    repository: Arc<dyn IdempotencyRepositoryTrait>,
}

impl IdempotencyGuard {
    pub fn new(repository: Arc<dyn IdempotencyRepositoryTrait>) -> Self {
        Self { repository }
    }

    pub fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.repository.get_record(key)
    }

    /// Tries to move `key` into `InProgress` for `owner_id`.
    ///
    /// Not started or failed keys are claimed, a stale in-progress key is
    /// reclaimed, a live in-progress key is refused, and a succeeded key is
    /// refused unless the policy allows a rerun. Job keys are additionally
    /// refused while any other job key of the scope is live.
    pub async fn check_and_mark_started(
        &self,
        scope: &SyncScope,
        kind: IdempotencyKind,
        key: &str,
        owner_id: &str,
        policy: ClaimPolicy,
    ) -> Result<ClaimOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();

            if kind == IdempotencyKind::Job {
                if let Some(busy) = self.live_sibling(scope, key, policy.stale_after, now)? {
                    debug!(
                        "[MenuSync] Scope {} busy with {} (owner {})",
                        scope, busy.key, busy.owner_id
                    );
                    return Ok(refused(ClaimDecision::ScopeBusy, Some(busy)));
                }
            }

            let existing = self.repository.get_record(key)?;
            let decision = match existing.as_ref() {
                None => ClaimDecision::Acquired,
                Some(record) => match record.status {
                    IdempotencyStatus::InProgress if record.is_stale(now, policy.stale_after) => {
                        ClaimDecision::ReclaimedStale
                    }
                    IdempotencyStatus::InProgress => ClaimDecision::AlreadyInProgress,
                    IdempotencyStatus::Succeeded if policy.allow_rerun_after_success => {
                        ClaimDecision::RerunAfterSuccess
                    }
                    IdempotencyStatus::Succeeded => ClaimDecision::AlreadySucceeded,
                    IdempotencyStatus::Failed => ClaimDecision::RetryAfterFailure,
                },
            };

            if !decision.can_proceed() {
                return Ok(refused(decision, existing));
            }

            let claimed = IdempotencyRecord {
                key: key.to_string(),
                scope: scope.clone(),
                kind,
                status: IdempotencyStatus::InProgress,
                owner_id: owner_id.to_string(),
                version: existing.as_ref().map_or(1, |r| r.version + 1),
                attempt_count: existing.as_ref().map_or(1, |r| r.attempt_count + 1),
                started_at: now,
                heartbeat_at: now,
                completed_at: None,
                last_error: existing.as_ref().and_then(|r| r.last_error.clone()),
                created_at: existing.as_ref().map_or(now, |r| r.created_at),
                updated_at: now,
            };
            let expected = existing.as_ref().map(|r| r.version);

            if !self.repository.compare_and_set(claimed.clone(), expected).await? {
                debug!("[MenuSync] Lost claim race for {}, re-reading", key);
                continue;
            }

            if decision == ClaimDecision::ReclaimedStale {
                if let Some(previous) = existing.as_ref() {
                    warn!(
                        "[MenuSync] Reclaimed stale lock {} from owner {} (last heartbeat {})",
                        key, previous.owner_id, previous.heartbeat_at
                    );
                }
            }

            let lease = IdempotencyLease {
                key: key.to_string(),
                scope: scope.clone(),
                kind,
                owner_id: owner_id.to_string(),
                stale_after: policy.stale_after,
            };

            if kind == IdempotencyKind::Job {
                if let Some(earlier) = self.earlier_sibling(&claimed, policy.stale_after)? {
                    info!(
                        "[MenuSync] Yielding {} to concurrent job {} for scope {}",
                        key, earlier.key, scope
                    );
                    self.mark_failed(&lease, "yielded to a concurrent run").await?;
                    return Ok(refused(ClaimDecision::ScopeBusy, Some(earlier)));
                }
            }

            return Ok(ClaimOutcome {
                decision,
                existing,
                lease: Some(lease),
            });
        }

        Err(Error::Conflict(format!(
            "Could not claim idempotency key {} after {} attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    /// Heartbeat. Returns `false` when the lease was lost to another owner.
    pub async fn renew(&self, lease: &IdempotencyLease) -> Result<bool> {
        self.transition(lease, |record, now| {
            record.heartbeat_at = now;
        })
        .await
    }

    pub async fn mark_succeeded(&self, lease: &IdempotencyLease) -> Result<bool> {
        self.transition(lease, |record, now| {
            record.status = IdempotencyStatus::Succeeded;
            record.completed_at = Some(now);
            record.last_error = None;
        })
        .await
    }

    pub async fn mark_failed(&self, lease: &IdempotencyLease, error: &str) -> Result<bool> {
        let message: String = error.chars().take(MAX_ERROR_LEN).collect();
        self.transition(lease, move |record, now| {
            record.status = IdempotencyStatus::Failed;
            record.completed_at = Some(now);
            record.last_error = Some(message.clone());
        })
        .await
    }

    pub async fn purge_before(&self, scope: &SyncScope, cutoff: DateTime<Utc>) -> Result<usize> {
        self.repository.purge_before(scope.clone(), cutoff).await
    }

    async fn transition<F>(&self, lease: &IdempotencyLease, apply: F) -> Result<bool>
    where
        F: Fn(&mut IdempotencyRecord, DateTime<Utc>),
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.repository.get_record(&lease.key)? else {
                warn!("[MenuSync] Idempotency record {} vanished", lease.key);
                return Ok(false);
            };
            if !current.is_held_by(&lease.owner_id) {
                warn!(
                    "[MenuSync] Lease on {} lost: now {} by {}",
                    lease.key,
                    current.status.as_str(),
                    current.owner_id
                );
                return Ok(false);
            }

            let now = Utc::now();
            let mut next = current.clone();
            apply(&mut next, now);
            next.version = current.version + 1;
            next.updated_at = now;

            if self
                .repository
                .compare_and_set(next, Some(current.version))
                .await?
            {
                return Ok(true);
            }
        }
        Err(Error::Conflict(format!(
            "Idempotency record {} kept changing underneath its owner",
            lease.key
        )))
    }

    fn live_sibling(
        &self,
        scope: &SyncScope,
        key: &str,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .repository
            .list_in_progress(scope, IdempotencyKind::Job)?
            .into_iter()
            .find(|r| r.key != key && !r.is_stale(now, stale_after)))
    }

    /// Another live job claim of the scope that started before `ours`.
    fn earlier_sibling(
        &self,
        ours: &IdempotencyRecord,
        stale_after: Duration,
    ) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self
            .repository
            .list_in_progress(&ours.scope, IdempotencyKind::Job)?
            .into_iter()
            .filter(|r| r.key != ours.key && !r.is_stale(now, stale_after))
            .find(|r| (r.started_at, r.key.as_str()) < (ours.started_at, ours.key.as_str())))
    }
}

fn refused(decision: ClaimDecision, existing: Option<IdempotencyRecord>) -> ClaimOutcome {
    ClaimOutcome {
        decision,
        existing,
        lease: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryIdempotencyRepository;

    fn guard() -> (IdempotencyGuard, Arc<InMemoryIdempotencyRepository>) {
        let repo = Arc::new(InMemoryIdempotencyRepository::default());
        (IdempotencyGuard::new(repo.clone()), repo)
    }

    fn policy() -> ClaimPolicy {
        ClaimPolicy::new(Duration::minutes(30))
    }

    #[test]
    fn keys_are_derived_from_scope_bucket_and_content() {
        let scope = SyncScope::account("acc-1").with_branch("b1");
        let at = DateTime::parse_from_rfc3339("2026-01-05T10:07:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let same_bucket = at + Duration::minutes(5);
        assert_eq!(job_key(&scope, at, 900), job_key(&scope, same_bucket, 900));
        assert_ne!(job_key(&scope, at, 900), job_key(&scope, at + Duration::minutes(10), 900));

        let key = content_key(&scope, Some(3), "sha256:abc", false);
        assert_eq!(key, "sync-content:acc-1|b1|-:v3:sha256:abc");
        assert_ne!(key, content_key(&scope, Some(3), "sha256:abc", true));
        assert_ne!(key, content_key(&scope, Some(4), "sha256:abc", false));
    }

    #[tokio::test]
    async fn first_claim_proceeds_and_second_is_refused() {
        let (guard, _) = guard();
        let scope = SyncScope::account("acc-1");
        let first = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-a", policy())
            .await
            .unwrap();
        assert!(first.can_proceed());
        assert_eq!(first.decision, ClaimDecision::Acquired);

        let second = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-b", policy())
            .await
            .unwrap();
        assert!(!second.can_proceed());
        assert_eq!(second.decision, ClaimDecision::AlreadyInProgress);
        assert_eq!(second.existing.unwrap().owner_id, "run-a");
    }

    #[tokio::test]
    async fn succeeded_key_is_not_rerun_unless_allowed() {
        let (guard, _) = guard();
        let scope = SyncScope::account("acc-1");
        let claim = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-a", policy())
            .await
            .unwrap();
        assert!(guard.mark_succeeded(claim.lease.as_ref().unwrap()).await.unwrap());

        let again = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-b", policy())
            .await
            .unwrap();
        assert_eq!(again.decision, ClaimDecision::AlreadySucceeded);

        let forced = guard
            .check_and_mark_started(
                &scope,
                IdempotencyKind::Content,
                "k1",
                "run-c",
                policy().allowing_rerun(true),
            )
            .await
            .unwrap();
        assert_eq!(forced.decision, ClaimDecision::RerunAfterSuccess);
    }

    #[tokio::test]
    async fn failed_key_can_be_retried() {
        let (guard, repo) = guard();
        let scope = SyncScope::account("acc-1");
        let claim = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-a", policy())
            .await
            .unwrap();
        guard
            .mark_failed(claim.lease.as_ref().unwrap(), "timeout")
            .await
            .unwrap();

        let retry = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-b", policy())
            .await
            .unwrap();
        assert_eq!(retry.decision, ClaimDecision::RetryAfterFailure);
        let record = repo.get_record("k1").unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.owner_id, "run-b");
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_and_old_owner_cannot_release_it() {
        let (guard, _) = guard();
        let scope = SyncScope::account("acc-1");
        let short = ClaimPolicy::new(Duration::zero());
        let crashed = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-a", short)
            .await
            .unwrap();

        let reclaim = guard
            .check_and_mark_started(&scope, IdempotencyKind::Content, "k1", "run-b", short)
            .await
            .unwrap();
        assert_eq!(reclaim.decision, ClaimDecision::ReclaimedStale);

        let old_lease = crashed.lease.unwrap();
        assert!(!guard.mark_succeeded(&old_lease).await.unwrap());
        assert!(!guard.renew(&old_lease).await.unwrap());
        assert!(guard.renew(reclaim.lease.as_ref().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn live_job_in_another_bucket_blocks_the_scope() {
        let (guard, _) = guard();
        let scope = SyncScope::account("acc-1");
        let first = guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, "sync-job:a:1", "run-a", policy())
            .await
            .unwrap();
        assert!(first.can_proceed());

        let next_bucket = guard
            .check_and_mark_started(&scope, IdempotencyKind::Job, "sync-job:a:2", "run-b", policy())
            .await
            .unwrap();
        assert_eq!(next_bucket.decision, ClaimDecision::ScopeBusy);

        let other_scope = SyncScope::account("acc-2");
        let unrelated = guard
            .check_and_mark_started(
                &other_scope,
                IdempotencyKind::Job,
                "sync-job:b:2",
                "run-c",
                policy(),
            )
            .await
            .unwrap();
        assert!(unrelated.can_proceed());
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one() {
        let (guard, _) = guard();
        let scope = SyncScope::account("acc-1");
        let mut handles = Vec::new();
        for i in 0..8 {
            let guard = guard.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .check_and_mark_started(
                        &scope,
                        IdempotencyKind::Job,
                        "sync-job:acc-1:7",
                        &format!("run-{i}"),
                        policy(),
                    )
                    .await
                    .unwrap()
                    .can_proceed()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
