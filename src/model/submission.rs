//! Submission ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Answers, ItemId, Owner};

/// An append-only record of committed answers. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub item_id: ItemId,
    pub owner: Owner,
    pub answers: Answers,
    pub submitted_at: DateTime<Utc>,
}

/// Selects ledger entries by item and/or owner. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct SubmissionFilter {
    pub item_id: Option<ItemId>,
    pub owner: Option<Owner>,
}

impl SubmissionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn item(mut self, id: ItemId) -> Self {
        self.item_id = Some(id);
        self
    }

    pub fn owner(mut self, owner: Owner) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn matches(&self, submission: &Submission) -> bool {
        self.item_id
            .as_ref()
            .is_none_or(|id| *id == submission.item_id)
            && self
                .owner
                .as_ref()
                .is_none_or(|o| *o == submission.owner)
    }
}
