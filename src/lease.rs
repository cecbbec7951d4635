//! Lease manager: the coordinator's public operations.
//!
//! Every operation is a short, independent call against a [`Store`]. The
//! manager holds no per-item state of its own, so any number of managers in
//! any number of processes can share one store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument as _, Span, debug, info, warn};

use crate::error::Result;
use crate::model::{Answers, ItemId, ItemState, Owner, PoolStats, Submission, SubmissionFilter, WorkItem};
use crate::store::{ClaimAttempt, Completion, Store};
use crate::sweep;
use crate::telemetry::lease::{record_item, record_transition, start_lease_span};
use crate::telemetry::metrics;

/// Default lease length: two hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Default bound on claim attempts lost to concurrent claimants.
pub const DEFAULT_CLAIM_ATTEMPTS: u32 = 5;

/// Lease length and claim retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub ttl: Duration,
    /// How many candidates one `claim` may lose to other claimants before
    /// giving up with `None`.
    pub claim_attempts: u32,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            claim_attempts: DEFAULT_CLAIM_ATTEMPTS,
        }
    }
}

pub struct LeaseManager<S: Store + ?Sized = dyn Store> {
    store: Arc<S>,
    policy: LeasePolicy,
}

impl<S: Store + ?Sized> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
        }
    }
}

impl<S: Store + ?Sized> LeaseManager<S> {
    pub fn new(store: Arc<S>, policy: LeasePolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    pub fn ttl(&self) -> Duration {
        self.policy.ttl
    }

    // -----------------------------------------------------------------------
    // Lease operations
    // -----------------------------------------------------------------------

    /// Claim one eligible item for `owner`, sweeping expired leases first.
    ///
    /// Returns `None` when nothing is claimable, or when every candidate was
    /// taken by someone else within the attempt bound.
    pub async fn claim(&self, owner: &Owner) -> Result<Option<WorkItem>> {
        let span = start_lease_span("claim", None, owner);
        let started = Instant::now();

        let result = self.claim_inner(owner, &span).instrument(span.clone()).await;
        let outcome = match &result {
            Ok(Some(_)) => "ok",
            Ok(None) => "empty",
            Err(_) => "error",
        };
        observe("claim", outcome, started);
        result
    }

    async fn claim_inner(&self, owner: &Owner, span: &Span) -> Result<Option<WorkItem>> {
        sweep::reclaim_expired(&*self.store).await?;

        let mut skip = HashSet::new();
        for attempt in 1..=self.policy.claim_attempts {
            match self.store.try_claim(owner, self.policy.ttl, &skip).await? {
                ClaimAttempt::Claimed(item) => {
                    record_item(span, &item.id);
                    record_transition(span, ItemState::Unclaimed, ItemState::Claimed);
                    info!(item = %item.id, expires_at = ?item.lease_expiry(), "claimed");
                    return Ok(Some(*item));
                }
                ClaimAttempt::Lost(id) => {
                    debug!(attempt, item = %id, "lost claim race");
                    skip.insert(id);
                }
                ClaimAttempt::Exhausted => {
                    debug!(attempt, "no claimable item");
                    return Ok(None);
                }
            }
        }

        warn!(
            attempts = self.policy.claim_attempts,
            "gave up claiming after repeated races"
        );
        Ok(None)
    }

    /// Extend `owner`'s lease on `id` to `now + ttl`. `false` means the
    /// caller no longer holds the item.
    pub async fn renew(&self, id: &ItemId, owner: &Owner, ttl: Duration) -> Result<bool> {
        let span = start_lease_span("renew", Some(id), owner);
        let started = Instant::now();

        let result = self
            .store
            .renew(id, owner, ttl)
            .instrument(span.clone())
            .await;
        match &result {
            Ok(true) => span.in_scope(|| debug!(ttl_secs = ttl.as_secs_f64(), "renewed")),
            Ok(false) => span.in_scope(|| info!("renewal refused; lease lost")),
            Err(_) => {}
        }
        observe("renew", bool_outcome(&result), started);
        result
    }

    /// Give `id` back to the pool. `false` means `owner` did not hold it,
    /// so there is nothing to undo.
    pub async fn abandon(&self, id: &ItemId, owner: &Owner) -> Result<bool> {
        let span = start_lease_span("abandon", Some(id), owner);
        let started = Instant::now();

        let result = self.store.release(id, owner).instrument(span.clone()).await;
        if matches!(result, Ok(true)) {
            record_transition(&span, ItemState::Claimed, ItemState::Unclaimed);
        }
        observe("abandon", bool_outcome(&result), started);
        result
    }

    /// Commit `answers` for `id`. `true` when the item is now `Done` by
    /// `owner`, including a retry after an earlier success.
    pub async fn complete(&self, id: &ItemId, owner: &Owner, answers: &Answers) -> Result<bool> {
        let span = start_lease_span("complete", Some(id), owner);
        let started = Instant::now();

        let result = self
            .store
            .complete(id, owner, answers)
            .instrument(span.clone())
            .await;
        let outcome = match &result {
            Ok(Completion::Committed(_)) => {
                record_transition(&span, ItemState::Claimed, ItemState::Done);
                metrics::submissions_recorded()
                    .add(1, &[KeyValue::new("backend", self.store.backend())]);
                "ok"
            }
            Ok(Completion::AlreadyDone) => {
                span.in_scope(|| debug!("already completed by this owner"));
                "already_done"
            }
            Ok(Completion::Rejected) => {
                span.in_scope(|| info!("completion refused; lease lost"));
                "lost"
            }
            Err(_) => "error",
        };
        observe("complete", outcome, started);
        result.map(|c| c.accepted())
    }

    /// Run the reclamation sweep on its own.
    pub async fn reap_expired(&self) -> Result<u64> {
        sweep::reclaim_expired(&*self.store).await
    }

    // -----------------------------------------------------------------------
    // Read paths
    // -----------------------------------------------------------------------

    pub async fn item(&self, id: &ItemId) -> Result<Option<WorkItem>> {
        self.store.get(id).await
    }

    pub async fn items(&self) -> Result<Vec<WorkItem>> {
        self.store.list().await
    }

    /// Items per state. A lease that expired but was not swept yet still
    /// counts as claimed.
    pub async fn stats(&self) -> Result<PoolStats> {
        let mut stats = PoolStats::default();
        for item in self.store.list().await? {
            stats.record(item.state);
        }
        Ok(stats)
    }

    pub async fn submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
        self.store.submissions(filter).await
    }
}

fn bool_outcome(result: &Result<bool>) -> &'static str {
    match result {
        Ok(true) => "ok",
        Ok(false) => "lost",
        Err(_) => "error",
    }
}

fn observe(operation: &'static str, outcome: &'static str, started: Instant) {
    metrics::lease_operations().add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("result", outcome),
        ],
    );
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", format!("lease.{operation}"))],
    );
}
