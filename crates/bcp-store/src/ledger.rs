//! The dispatch ledger and the admission linearization point.

use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{ensure_live, AdmittedJob, CompleteOutcome, CoreError};

use crate::store_err;

/// Atomically move one entry from the queue to the ledger.
///
/// One transaction, in order:
/// 1. lock the queue row (`for update`): `NotFound` if it vanished;
/// 2. lock the organization row; every concurrent admit for the same org
///    queues behind this lock, so the counts read below are current, not
///    values sampled before the transaction;
/// 3. lock the agent row, read both limits and both in-flight counts;
/// 4. re-check the limits; `LimitViolated` rolls back;
/// 5. delete the queue row, insert the ledger row with
///    `started_at_utc = now()`.
///
/// Checking limits in one transaction and admitting in another is
/// exactly the race this function exists to close.
pub(crate) async fn admit_atomic(
    pool: &PgPool,
    cancel: &CancellationToken,
    entry_id: Uuid,
) -> Result<AdmittedJob, CoreError> {
    ensure_live(cancel)?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| store_err(e, "admit begin failed"))?;

    let row = sqlx::query(
        r#"
        select entry_id, schedule_id, org_id, agent_id
        from queue_entries
        where entry_id = $1
        for update
        "#,
    )
    .bind(entry_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| store_err(e, "admit claim failed"))?;

    let Some(row) = row else {
        // Lost the race with a cancel or a competing admitter.
        return Err(CoreError::not_found(format!(
            "queue entry {entry_id} no longer exists"
        )));
    };

    let schedule_id: Uuid = row
        .try_get("schedule_id")
        .map_err(|e| store_err(e, "admit decode"))?;
    let org_id: Uuid = row.try_get("org_id").map_err(|e| store_err(e, "admit decode"))?;
    let agent_id: Uuid = row
        .try_get("agent_id")
        .map_err(|e| store_err(e, "admit decode"))?;

    // Org row lock is the serialization point for same-org admissions.
    let (org_limit,): (Option<i32>,) = sqlx::query_as(
        "select max_concurrent_backups from organizations where org_id = $1 for update",
    )
    .bind(org_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| store_err(e, "admit org lock failed"))?;

    let (agent_limit,): (Option<i32>,) =
        sqlx::query_as("select max_concurrent_backups from agents where agent_id = $1 for update")
            .bind(agent_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_err(e, "admit agent lock failed"))?;

    let (org_running,): (i64,) =
        sqlx::query_as("select count(*)::bigint from running_backups where org_id = $1")
            .bind(org_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_err(e, "admit org count failed"))?;

    let (agent_running,): (i64,) =
        sqlx::query_as("select count(*)::bigint from running_backups where agent_id = $1")
            .bind(agent_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| store_err(e, "admit agent count failed"))?;

    if let Some(limit) = org_limit {
        if org_running + 1 > i64::from(limit) {
            return Err(CoreError::limit_violated(format!(
                "org {org_id}: {org_running} running, limit {limit}"
            )));
        }
    }
    if let Some(limit) = agent_limit {
        if agent_running + 1 > i64::from(limit) {
            return Err(CoreError::limit_violated(format!(
                "agent {agent_id}: {agent_running} running, limit {limit}"
            )));
        }
    }

    ensure_live(cancel)?;

    sqlx::query("delete from queue_entries where entry_id = $1")
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err(e, "admit dequeue failed"))?;

    let running_id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        insert into running_backups (running_id, entry_id, schedule_id, org_id, agent_id, started_at_utc)
        values ($1, $2, $3, $4, $5, now())
        returning started_at_utc
        "#,
    )
    .bind(running_id)
    .bind(entry_id)
    .bind(schedule_id)
    .bind(org_id)
    .bind(agent_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| store_err(e, "admit ledger insert failed"))?;

    let started_at = row
        .try_get("started_at_utc")
        .map_err(|e| store_err(e, "admit decode"))?;

    tx.commit()
        .await
        .map_err(|e| store_err(e, "admit commit failed"))?;

    Ok(AdmittedJob {
        running_id,
        entry_id,
        schedule_id,
        org_id,
        agent_id,
        started_at,
    })
}

/// Remove a ledger row. Idempotent: an unknown id is a `NoOp` success so
/// duplicate terminal reports from the transport edge are harmless.
pub(crate) async fn complete(
    pool: &PgPool,
    cancel: &CancellationToken,
    running_id: Uuid,
) -> Result<CompleteOutcome, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> =
        sqlx::query_as("delete from running_backups where running_id = $1 returning running_id")
            .bind(running_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err(e, "complete failed"))?;

    Ok(match row {
        Some(_) => CompleteOutcome::Completed,
        None => CompleteOutcome::NoOp,
    })
}

pub(crate) async fn count_running_by_org(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<i64, CoreError> {
    ensure_live(cancel)?;

    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from running_backups where org_id = $1")
            .bind(org_id)
            .fetch_one(pool)
            .await
            .map_err(|e| store_err(e, "count_running_by_org failed"))?;
    Ok(n)
}

pub(crate) async fn count_running_by_agent(
    pool: &PgPool,
    cancel: &CancellationToken,
    agent_id: Uuid,
) -> Result<i64, CoreError> {
    ensure_live(cancel)?;

    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from running_backups where agent_id = $1")
            .bind(agent_id)
            .fetch_one(pool)
            .await
            .map_err(|e| store_err(e, "count_running_by_agent failed"))?;
    Ok(n)
}
