//! Postgres store: one row per item, leases as columns on the row.
//!
//! Claims select a candidate under a row lock and then apply a conditional
//! `UPDATE`; every other transition is a single conditional `UPDATE` whose
//! affected-row count says whether its precondition still held. All time
//! arithmetic uses the database clock.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;

use super::{ClaimAttempt, Completion, Store};
use crate::error::{Error, Result};
use crate::model::{
    Answers, ItemId, ItemState, Lease, NewWorkItem, Owner, Payload, Submission, SubmissionFilter,
    WorkItem,
};

const ITEM_COLUMNS: &str =
    "id, payload, state, owner, lease_expires_at, completed_by, completed_at";

/// Database handle. Owns the connection pool; each operation checks out a
/// connection only for its own duration.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options: PgConnectOptions = url.parse()?;
        Self::connect_with(options, max_connections).await
    }

    pub async fn connect_with(options: PgConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        // The WHERE clause is the guard: a renewal that commits first moves
        // the expiry and this row no longer matches.
        let reclaimed = sqlx::query(
            "UPDATE work_items
             SET state = 'unclaimed', owner = NULL, claimed_at = NULL, lease_expires_at = NULL, updated_at = now()
             WHERE state = 'claimed' AND lease_expires_at < now()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reclaimed)
    }

    async fn try_claim(
        &self,
        owner: &Owner,
        ttl: Duration,
        skip: &HashSet<ItemId>,
    ) -> Result<ClaimAttempt> {
        let skip: Vec<String> = skip.iter().map(|id| id.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM work_items
             WHERE state = 'unclaimed' AND NOT (id = ANY($1))
             ORDER BY random()
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(skip)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.rollback().await?;
            return Ok(ClaimAttempt::Exhausted);
        };

        let claimed: Option<WorkItemRow> = sqlx::query_as(&format!(
            "UPDATE work_items
             SET state = 'claimed', owner = $1, claimed_at = now(),
                 lease_expires_at = now() + make_interval(secs => $2), updated_at = now()
             WHERE id = $3 AND state = 'unclaimed'
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(owner.as_str())
        .bind(ttl.as_secs_f64())
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?;

        match claimed {
            Some(row) => {
                tx.commit().await?;
                Ok(ClaimAttempt::Claimed(Box::new(row.try_into_work_item()?)))
            }
            None => {
                tx.rollback().await?;
                Ok(ClaimAttempt::Lost(ItemId::new(id)?))
            }
        }
    }

    async fn renew(&self, id: &ItemId, owner: &Owner, ttl: Duration) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET lease_expires_at = GREATEST(lease_expires_at, now() + make_interval(secs => $1)),
                 updated_at = now()
             WHERE id = $2 AND state = 'claimed' AND owner = $3",
        )
        .bind(ttl.as_secs_f64())
        .bind(id.as_str())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn release(&self, id: &ItemId, owner: &Owner) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET state = 'unclaimed', owner = NULL, claimed_at = NULL, lease_expires_at = NULL, updated_at = now()
             WHERE id = $1 AND state = 'claimed' AND owner = $2",
        )
        .bind(id.as_str())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }

    async fn complete(
        &self,
        id: &ItemId,
        owner: &Owner,
        answers: &Answers,
    ) -> Result<Completion> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT state, owner, completed_by FROM work_items WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((state, holder, completed_by)) = current else {
            tx.rollback().await?;
            return Ok(Completion::Rejected);
        };

        let state: ItemState = state.parse()?;
        if state.is_terminal() {
            tx.rollback().await?;
            return Ok(if completed_by.as_deref() == Some(owner.as_str()) {
                Completion::AlreadyDone
            } else {
                Completion::Rejected
            });
        }
        let holds_lease = holder.as_deref() == Some(owner.as_str());
        if !state.can_transition_to(ItemState::Done) || !holds_lease {
            tx.rollback().await?;
            return Ok(Completion::Rejected);
        }

        let (submitted_at,): (DateTime<Utc>,) = sqlx::query_as(
            "INSERT INTO submissions (item_id, owner, answers) VALUES ($1, $2, $3)
             RETURNING submitted_at",
        )
        .bind(id.as_str())
        .bind(owner.as_str())
        .bind(Json(answers))
        .fetch_one(&mut *tx)
        .await?;

        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET state = 'done', owner = NULL, claimed_at = NULL, lease_expires_at = NULL,
                 completed_by = $2, completed_at = $3, updated_at = now()
             WHERE id = $1 AND state = 'claimed' AND owner = $2",
        )
        .bind(id.as_str())
        .bind(owner.as_str())
        .bind(submitted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected != 1 {
            tx.rollback().await?;
            return Ok(Completion::Rejected);
        }
        tx.commit().await?;

        Ok(Completion::Committed(Submission {
            item_id: id.clone(),
            owner: owner.clone(),
            answers: answers.clone(),
            submitted_at,
        }))
    }

    async fn get(&self, id: &ItemId) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItemRow::try_into_work_item).transpose()
    }

    async fn list(&self) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    async fn submissions(&self, filter: &SubmissionFilter) -> Result<Vec<Submission>> {
        let rows: Vec<SubmissionRow> = sqlx::query_as(
            "SELECT item_id, owner, answers, submitted_at FROM submissions
             WHERE ($1::text IS NULL OR item_id = $1)
             AND ($2::text IS NULL OR owner = $2)
             ORDER BY id ASC",
        )
        .bind(filter.item_id.as_ref().map(ItemId::as_str))
        .bind(filter.owner.as_ref().map(Owner::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(SubmissionRow::try_into_submission)
            .collect()
    }

    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for item in items {
            inserted += sqlx::query(
                "INSERT INTO work_items (id, payload, question_count)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(item.id.as_str())
            .bind(Json(&item.payload))
            .bind(i32::try_from(item.payload.question_count()).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    payload: Json<Payload>,
    state: String,
    owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    completed_by: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        let id = ItemId::new(self.id)?;
        let state: ItemState = self.state.parse()?;

        let lease = match (state, self.owner, self.lease_expires_at) {
            (ItemState::Claimed, Some(owner), Some(expires_at)) => Some(Lease {
                item_id: id.clone(),
                owner: Owner::new(owner)?,
                expires_at,
            }),
            (ItemState::Claimed, _, _) => {
                return Err(Error::Other(format!(
                    "claimed work item {id} has no owner or expiry"
                )));
            }
            _ => None,
        };

        Ok(WorkItem {
            id,
            state,
            lease,
            completed_by: self.completed_by.map(Owner::new).transpose()?,
            completed_at: self.completed_at,
            payload: self.payload.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    item_id: String,
    owner: String,
    answers: Json<Answers>,
    submitted_at: DateTime<Utc>,
}

impl SubmissionRow {
    fn try_into_submission(self) -> Result<Submission> {
        Ok(Submission {
            item_id: ItemId::new(self.item_id)?,
            owner: Owner::new(self.owner)?,
            answers: self.answers.0,
            submitted_at: self.submitted_at,
        })
    }
}
