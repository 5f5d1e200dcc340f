//! Queue custody: enqueue, idempotent cancel, ordered reads, summaries.
//!
//! Canonical order is expressed once per query as
//! `priority desc, queued_at_utc asc, entry_id asc`; the composite index
//! in the initial migration backs the scan.

use std::collections::BTreeMap;

use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{ensure_live, CancelOutcome, CoreError, NewQueueEntry, QueuedJob};
use bcp_schemas::{QueueEntryView, QueueSummary};

use crate::store_err;

/// Insert a new pending entry, resolving org, agent, and default priority
/// from the schedule in the same statement.
///
/// - Duplicate `entry_id` fails `Conflict` (idempotency-key behavior:
///   retries of the same enqueue collide instead of double-queueing).
/// - Unknown schedule fails `NotFound` (the insert selects zero rows).
pub(crate) async fn enqueue(
    pool: &PgPool,
    cancel: &CancellationToken,
    entry: NewQueueEntry,
) -> Result<QueuedJob, CoreError> {
    ensure_live(cancel)?;

    let row = sqlx::query(
        r#"
        insert into queue_entries (entry_id, schedule_id, org_id, agent_id, priority, queued_at_utc)
        select $1, s.schedule_id, a.org_id, s.agent_id, coalesce($3, s.priority), now()
        from schedules s
        join agents a on a.agent_id = s.agent_id
        where s.schedule_id = $2
        returning entry_id, org_id, agent_id, priority, queued_at_utc
        "#,
    )
    .bind(entry.entry_id)
    .bind(entry.schedule_id)
    .bind(entry.priority_override)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "enqueue failed"))?;

    let Some(row) = row else {
        return Err(CoreError::not_found(format!(
            "schedule {} does not exist",
            entry.schedule_id
        )));
    };

    Ok(QueuedJob {
        entry_id: row.try_get("entry_id").map_err(|e| store_err(e, "enqueue decode"))?,
        org_id: row.try_get("org_id").map_err(|e| store_err(e, "enqueue decode"))?,
        agent_id: row.try_get("agent_id").map_err(|e| store_err(e, "enqueue decode"))?,
        priority: row.try_get("priority").map_err(|e| store_err(e, "enqueue decode"))?,
        queued_at: row
            .try_get("queued_at_utc")
            .map_err(|e| store_err(e, "enqueue decode"))?,
    })
}

/// Remove a queued entry by id, scoped to the caller's org.
///
/// Idempotent: an absent id (or an id belonging to another org) is a
/// `NoOp` success, indistinguishable from "already gone". Running entries
/// live in a different table and are never touched here.
pub(crate) async fn cancel_by_id(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
    entry_id: Uuid,
) -> Result<CancelOutcome, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        delete from queue_entries
        where entry_id = $1
          and org_id   = $2
        returning entry_id
        "#,
    )
    .bind(entry_id)
    .bind(org_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "cancel_by_id failed"))?;

    Ok(match row {
        Some(_) => CancelOutcome::Canceled,
        None => CancelOutcome::NoOp,
    })
}

/// Ordered queue for one org with schedule names and agent hostnames.
/// Positions come from a window function so the whole view is consistent
/// at one transactional instant.
pub(crate) async fn list_queued_with_details(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<Vec<QueueEntryView>, CoreError> {
    ensure_live(cancel)?;

    let rows = sqlx::query(
        r#"
        select e.entry_id,
               e.schedule_id,
               s.display_name as schedule_name,
               e.agent_id,
               a.hostname     as agent_hostname,
               e.priority,
               e.queued_at_utc,
               row_number() over (
                   order by e.priority desc, e.queued_at_utc asc, e.entry_id asc
               ) as queue_position
        from queue_entries e
        join schedules s on s.schedule_id = e.schedule_id
        join agents a    on a.agent_id    = e.agent_id
        where e.org_id = $1
        order by e.priority desc, e.queued_at_utc asc, e.entry_id asc
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
    .map_err(|e| store_err(e, "list_queued_with_details failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(QueueEntryView {
            id: row.try_get("entry_id").map_err(|e| store_err(e, "list decode"))?,
            schedule_id: row
                .try_get("schedule_id")
                .map_err(|e| store_err(e, "list decode"))?,
            schedule_name: row
                .try_get("schedule_name")
                .map_err(|e| store_err(e, "list decode"))?,
            agent_id: row.try_get("agent_id").map_err(|e| store_err(e, "list decode"))?,
            agent_hostname: row
                .try_get("agent_hostname")
                .map_err(|e| store_err(e, "list decode"))?,
            priority: row.try_get("priority").map_err(|e| store_err(e, "list decode"))?,
            queue_position: row
                .try_get("queue_position")
                .map_err(|e| store_err(e, "list decode"))?,
            queued_at: row
                .try_get("queued_at_utc")
                .map_err(|e| store_err(e, "list decode"))?,
        });
    }
    Ok(out)
}

/// Queue summary: totals, mean wait in minutes, oldest entry, per-agent
/// breakdown. The optional fields are absent when the queue is empty.
pub(crate) async fn summary(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<QueueSummary, CoreError> {
    ensure_live(cancel)?;

    let totals = sqlx::query(
        r#"
        select count(*)::bigint as total_queued,
               coalesce(avg(extract(epoch from (now() - queued_at_utc)) / 60.0), 0)::float8
                   as avg_wait_minutes,
               min(queued_at_utc) as oldest_queued_at
        from queue_entries
        where org_id = $1
        "#,
    )
    .bind(org_id)
    .fetch_one(pool)
    .await
    .map_err(|e| store_err(e, "summary totals failed"))?;

    let total_queued: i64 = totals
        .try_get("total_queued")
        .map_err(|e| store_err(e, "summary decode"))?;
    let avg_wait_minutes: f64 = totals
        .try_get("avg_wait_minutes")
        .map_err(|e| store_err(e, "summary decode"))?;
    let oldest_queued_at = totals
        .try_get("oldest_queued_at")
        .map_err(|e| store_err(e, "summary decode"))?;

    let (total_running,): (i64,) =
        sqlx::query_as("select count(*)::bigint from running_backups where org_id = $1")
            .bind(org_id)
            .fetch_one(pool)
            .await
            .map_err(|e| store_err(e, "summary running count failed"))?;

    let queued_by_agent = if total_queued > 0 {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            select agent_id, count(*)::bigint
            from queue_entries
            where org_id = $1
            group by agent_id
            order by agent_id
            "#,
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(|e| store_err(e, "summary per-agent counts failed"))?;

        Some(rows.into_iter().collect::<BTreeMap<Uuid, i64>>())
    } else {
        None
    };

    Ok(QueueSummary {
        total_queued,
        total_running,
        avg_wait_minutes,
        oldest_queued_at,
        queued_by_agent,
    })
}

const QUEUED_JOB_COLUMNS: &str =
    "entry_id, org_id, agent_id, priority, queued_at_utc";

fn decode_queued_job(row: sqlx::postgres::PgRow) -> Result<QueuedJob, CoreError> {
    Ok(QueuedJob {
        entry_id: row
            .try_get("entry_id")
            .map_err(|e| store_err(e, "queued job decode"))?,
        org_id: row
            .try_get("org_id")
            .map_err(|e| store_err(e, "queued job decode"))?,
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| store_err(e, "queued job decode"))?,
        priority: row
            .try_get("priority")
            .map_err(|e| store_err(e, "queued job decode"))?,
        queued_at: row
            .try_get("queued_at_utc")
            .map_err(|e| store_err(e, "queued job decode"))?,
    })
}

/// The canonical-first queued entry for `org`, or `None`.
pub(crate) async fn peek_next(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<Option<QueuedJob>, CoreError> {
    ensure_live(cancel)?;

    let row = sqlx::query(&format!(
        r#"
        select {QUEUED_JOB_COLUMNS}
        from queue_entries
        where org_id = $1
        order by priority desc, queued_at_utc asc, entry_id asc
        limit 1
        "#
    ))
    .bind(org_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "peek_next failed"))?;

    row.map(decode_queued_job).transpose()
}

/// All queued entries for `org` in canonical order; the planner's input.
pub(crate) async fn queued_jobs(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<Vec<QueuedJob>, CoreError> {
    ensure_live(cancel)?;

    let rows = sqlx::query(&format!(
        r#"
        select {QUEUED_JOB_COLUMNS}
        from queue_entries
        where org_id = $1
        order by priority desc, queued_at_utc asc, entry_id asc
        "#
    ))
    .bind(org_id)
    .fetch_all(pool)
    .await
    .map_err(|e| store_err(e, "queued_jobs failed"))?;

    rows.into_iter().map(decode_queued_job).collect()
}

pub(crate) async fn count_queued_by_org(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<i64, CoreError> {
    ensure_live(cancel)?;

    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from queue_entries where org_id = $1")
            .bind(org_id)
            .fetch_one(pool)
            .await
            .map_err(|e| store_err(e, "count_queued_by_org failed"))?;
    Ok(n)
}

pub(crate) async fn count_queued_by_agent(
    pool: &PgPool,
    cancel: &CancellationToken,
    agent_id: Uuid,
) -> Result<i64, CoreError> {
    ensure_live(cancel)?;

    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from queue_entries where agent_id = $1")
            .bind(agent_id)
            .fetch_one(pool)
            .await
            .map_err(|e| store_err(e, "count_queued_by_agent failed"))?;
    Ok(n)
}

/// Orgs with at least one queued entry; the tick safety net's work list.
pub(crate) async fn orgs_with_queued_entries(
    pool: &PgPool,
    cancel: &CancellationToken,
) -> Result<Vec<Uuid>, CoreError> {
    ensure_live(cancel)?;

    let rows: Vec<(Uuid,)> =
        sqlx::query_as("select distinct org_id from queue_entries order by org_id")
            .fetch_all(pool)
            .await
            .map_err(|e| store_err(e, "orgs_with_queued_entries failed"))?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
