//! The narrow transactional store contract the core consumes.
//!
//! Two implementations satisfy this trait under the same linearization
//! contract (single writer per org while a pass lock is held, atomic
//! limit re-check inside `admit_atomic`): the Postgres store in
//! `bcp-store` and the in-memory store in `bcp-testkit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_schemas::{QueueEntryView, QueueSummary};

use crate::error::CoreError;

/// Insert request for a new queue entry.
///
/// `entry_id` is caller-supplied so external triggers can retry enqueues
/// idempotently; a collision fails with `Conflict`. Priority defaults to
/// the schedule's priority; `priority_override` pins it for this entry
/// (manual runs may boost).
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub entry_id: Uuid,
    pub schedule_id: Uuid,
    pub priority_override: Option<i32>,
}

/// A queued entry as the planner sees it: just enough to order and to
/// charge limits. Produced in canonical order by `queued_jobs` and
/// `peek_next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub entry_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: Uuid,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

/// A ledger row created by a successful admission.
#[derive(Debug, Clone)]
pub struct AdmittedJob {
    pub running_id: Uuid,
    pub entry_id: Uuid,
    pub schedule_id: Uuid,
    pub org_id: Uuid,
    pub agent_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Outcome of an idempotent cancel. `NoOp` means the entry was already
/// gone (completed, admitted, or never existed): still a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NoOp,
}

/// Outcome of an idempotent completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    NoOp,
}

/// Held for the duration of one admission pass; serializes passes for one
/// org across scheduler replicas. Dropping the guard releases the lock
/// (rollback of the lock-holding transaction, or mutex drop in-memory);
/// `release` is the explicit, error-reporting path.
#[async_trait]
pub trait OrgPassLock: Send {
    fn org_id(&self) -> Uuid;

    async fn release(self: Box<Self>) -> Result<(), CoreError>;
}

/// Durable, transactional custody of queue entries, the dispatch ledger,
/// and concurrency limits.
///
/// Every operation accepts a `CancellationToken` and fails with
/// `CoreError::Canceled` when the caller abandoned the call before a
/// mutation committed. Mutations are atomic with respect to concurrent
/// readers: partial states are never observable.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new pending entry. Fails `Conflict` if `entry_id` exists,
    /// `NotFound` if the schedule is unknown.
    async fn enqueue(
        &self,
        cancel: &CancellationToken,
        entry: NewQueueEntry,
    ) -> Result<QueuedJob, CoreError>;

    /// Remove a queued entry. Idempotent and org-scoped: an id that is
    /// absent (or belongs to another org) is a `NoOp` success. Never
    /// touches running entries.
    async fn cancel_by_id(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        entry_id: Uuid,
    ) -> Result<CancelOutcome, CoreError>;

    /// Ordered queue for one org, joined with schedule name and agent
    /// hostname, positions filled from one transactional instant.
    async fn list_queued_with_details(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueueEntryView>, CoreError>;

    /// Queue summary for one org (totals, average wait, oldest entry,
    /// per-agent breakdown).
    async fn summary(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<QueueSummary, CoreError>;

    /// The canonical-first queued entry for `org`, if any.
    async fn peek_next(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<QueuedJob>, CoreError>;

    /// All queued entries for `org` in canonical order; the planner's
    /// input snapshot.
    async fn queued_jobs(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueuedJob>, CoreError>;

    /// The single linearization point of admission. In one transaction:
    /// verify the entry still exists, re-check org and agent limits
    /// against current in-flight counts, remove the entry from the queue,
    /// insert the ledger row with `started_at = now`.
    ///
    /// Errors: `NotFound` (entry vanished; lost race with cancel or a
    /// competing admitter), `LimitViolated` (the in-transaction re-check
    /// failed).
    async fn admit_atomic(
        &self,
        cancel: &CancellationToken,
        entry_id: Uuid,
    ) -> Result<AdmittedJob, CoreError>;

    /// Remove a ledger row. Idempotent.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<CompleteOutcome, CoreError>;

    async fn count_running_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError>;

    async fn count_running_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError>;

    async fn count_queued_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError>;

    async fn count_queued_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError>;

    /// Current org limit. `None` = unlimited. Fails `NotFound` for an
    /// unknown org.
    async fn get_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<i32>, CoreError>;

    /// Write the org limit. Values are validated non-negative by the
    /// caller (`validate_limit`); the store additionally enforces the
    /// check constraint. Idempotent for an unchanged value.
    async fn set_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError>;

    async fn get_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Option<i32>, CoreError>;

    async fn set_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError>;

    /// Organization the agent is bound to. Fails `NotFound` for an
    /// unknown agent.
    async fn agent_org(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Uuid, CoreError>;

    /// Organization a schedule resolves to (via its agent). Fails
    /// `NotFound` for an unknown schedule; callers authorize against
    /// this org before enqueueing.
    async fn schedule_org(
        &self,
        cancel: &CancellationToken,
        schedule_id: Uuid,
    ) -> Result<Uuid, CoreError>;

    /// Organization of a ledger row, `None` when the row is already gone
    /// (the idempotent-completion path).
    async fn running_org(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<Option<Uuid>, CoreError>;

    /// Try to become the authoritative admitter for `org`. Returns `None`
    /// when another scheduler replica holds the pass lock; the caller
    /// must skip the pass, not wait.
    async fn acquire_org_lock(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<Box<dyn OrgPassLock>>, CoreError>;

    /// Orgs that currently have at least one queued entry. Drives the
    /// periodic tick safety net; correctness never depends on it.
    async fn orgs_with_queued_entries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, CoreError>;
}
