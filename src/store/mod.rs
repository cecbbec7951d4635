//! Work item stores.
//!
//! A store is the single source of truth for item state and provides the
//! per-item compare-and-swap the lease protocol is built on. Two backends
//! implement the same contract with different primitives:
//!
//! - [`fs::FsStore`]: exclusive creation of a lock file next to each item.
//! - [`postgres::PgStore`]: row locks plus conditional `UPDATE`s whose
//!   affected-row count tells whether the precondition still held.
//!
//! Every method is a short, self-contained critical section. Nothing is held
//! open between calls.

pub mod fs;
pub mod postgres;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Answers, ItemId, NewWorkItem, Owner, Submission, SubmissionFilter, WorkItem};

/// Outcome of one atomic claim attempt.
#[derive(Debug)]
pub enum ClaimAttempt {
    /// The item is now `Claimed` by the caller.
    Claimed(Box<WorkItem>),
    /// The candidate was taken between selection and update. Try another.
    Lost(ItemId),
    /// No eligible item right now.
    Exhausted,
}

/// Outcome of a completion attempt.
#[derive(Debug)]
pub enum Completion {
    /// Answers appended to the ledger and the item moved to `Done`.
    Committed(Submission),
    /// The item was already `Done` by this owner. Nothing was written.
    AlreadyDone,
    /// The caller does not hold the item (lost lease, other owner, or unknown id).
    Rejected,
}

impl Completion {
    pub fn accepted(&self) -> bool {
        !matches!(self, Completion::Rejected)
    }
}

/// Per-item compare-and-swap over `(state, owner, lease_expiry)`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Return every `Claimed` item whose lease has expired to `Unclaimed`.
    /// Stray locks on `Done` items are cleared as well. Returns how many
    /// items were touched.
    async fn reclaim_expired(&self) -> Result<u64>;

    /// Try to move one randomly chosen `Unclaimed` item, not in `skip`, to
    /// `Claimed` by `owner` with a lease of `ttl`.
    async fn try_claim(
        &self,
        owner: &Owner,
        ttl: Duration,
        skip: &HashSet<ItemId>,
    ) -> Result<ClaimAttempt>;

    /// Extend the lease to `now + ttl` iff `owner` holds it.
    async fn renew(&self, id: &ItemId, owner: &Owner, ttl: Duration) -> Result<bool>;

    /// `Claimed -> Unclaimed` iff `owner` holds it.
    async fn release(&self, id: &ItemId, owner: &Owner) -> Result<bool>;

    /// Record a submission and move to `Done` iff `owner` holds it.
    async fn complete(&self, id: &ItemId, owner: &Owner, answers: &Answers)
    -> Result<Completion>;

    async fn get(&self, id: &ItemId) -> Result<Option<WorkItem>>;

    async fn list(&self) -> Result<Vec<WorkItem>>;

    /// Ledger entries matching `filter`, in append order.
    async fn submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>>;

    /// Add items that do not exist yet. Existing items are left untouched.
    /// Returns how many were inserted.
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<u64>;
}
