//! Core data model.
//!
//! A work item is an immutable question payload plus a small amount of
//! mutable lifecycle: who holds it, until when, and whether it is done.

pub mod payload;
pub mod submission;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use payload::{AnswerProblem, Answers, Choice, Payload, Question};
pub use submission::{Submission, SubmissionFilter};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable, globally unique work item identifier.
///
/// For items loaded from disk this is the path relative to the items root,
/// with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidItemId("empty id".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Opaque client token. Trusted as supplied; only its shape is checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub const MAX_LEN: usize = 128;

    pub fn new(token: impl AsRef<str>) -> Result<Self> {
        let token = token.as_ref().trim();
        if token.is_empty() {
            return Err(Error::InvalidOwner("empty token".to_string()));
        }
        if token.chars().count() > Self::MAX_LEN {
            return Err(Error::InvalidOwner(format!(
                "token longer than {} characters",
                Self::MAX_LEN
            )));
        }
        if token.chars().any(char::is_control) {
            return Err(Error::InvalidOwner(
                "token contains control characters".to_string(),
            ));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Owner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// In the pool, claimable by anyone.
    Unclaimed,
    /// Held under a lease by exactly one owner.
    Claimed,
    /// Answers committed. Terminal.
    Done,
}

impl ItemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Unclaimed, Claimed)
                | (Claimed, Claimed)    // renew
                | (Claimed, Unclaimed)  // abandon or reclaimed
                | (Claimed, Done)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Unclaimed => "unclaimed",
            ItemState::Claimed => "claimed",
            ItemState::Done => "done",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unclaimed" => Ok(ItemState::Unclaimed),
            "claimed" => Ok(ItemState::Claimed),
            "done" => Ok(ItemState::Done),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A time-bounded exclusive grant over one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub item_id: ItemId,
    pub owner: Owner,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A work item as seen at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,

    pub state: ItemState,

    /// Present only while `Claimed`.
    pub lease: Option<Lease>,

    /// Who committed the answers. Present only once `Done`.
    pub completed_by: Option<Owner>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Immutable question content.
    pub payload: Payload,
}

impl WorkItem {
    pub fn owner(&self) -> Option<&Owner> {
        self.lease.as_ref().map(|l| &l.owner)
    }

    pub fn lease_expiry(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.expires_at)
    }

    pub fn is_held_by(&self, owner: &Owner) -> bool {
        self.owner() == Some(owner)
    }
}

/// An item as produced by the offline generator, before it enters a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub id: ItemId,
    pub payload: Payload,
}

impl NewWorkItem {
    pub fn new(id: ItemId, payload: Payload) -> Self {
        Self { id, payload }
    }
}

impl From<WorkItem> for NewWorkItem {
    fn from(item: WorkItem) -> Self {
        Self {
            id: item.id,
            payload: item.payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Pool stats
// ---------------------------------------------------------------------------

/// Item counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub unclaimed: usize,
    pub claimed: usize,
    pub done: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.unclaimed + self.claimed + self.done
    }

    pub fn record(&mut self, state: ItemState) {
        match state {
            ItemState::Unclaimed => self.unclaimed += 1,
            ItemState::Claimed => self.claimed += 1,
            ItemState::Done => self.done += 1,
        }
    }
}
