//! Concurrency limit reads and writes for orgs and agents.
//!
//! Value validation (non-negative or null) happens in `bcp-core` before
//! these run; the schema's check constraints are the last line.

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{ensure_live, CoreError};

use crate::store_err;

pub(crate) async fn get_org_limit(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
) -> Result<Option<i32>, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Option<i32>,)> =
        sqlx::query_as("select max_concurrent_backups from organizations where org_id = $1")
            .bind(org_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err(e, "get_org_limit failed"))?;

    match row {
        Some((limit,)) => Ok(limit),
        None => Err(CoreError::not_found(format!("organization {org_id}"))),
    }
}

/// Idempotent by construction: writing an unchanged value is a plain
/// update to the same state.
pub(crate) async fn set_org_limit(
    pool: &PgPool,
    cancel: &CancellationToken,
    org_id: Uuid,
    limit: Option<i32>,
) -> Result<(), CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update organizations
           set max_concurrent_backups = $2
         where org_id = $1
        returning org_id
        "#,
    )
    .bind(org_id)
    .bind(limit)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "set_org_limit failed"))?;

    match row {
        Some(_) => Ok(()),
        None => Err(CoreError::not_found(format!("organization {org_id}"))),
    }
}

pub(crate) async fn get_agent_limit(
    pool: &PgPool,
    cancel: &CancellationToken,
    agent_id: Uuid,
) -> Result<Option<i32>, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Option<i32>,)> =
        sqlx::query_as("select max_concurrent_backups from agents where agent_id = $1")
            .bind(agent_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err(e, "get_agent_limit failed"))?;

    match row {
        Some((limit,)) => Ok(limit),
        None => Err(CoreError::not_found(format!("agent {agent_id}"))),
    }
}

pub(crate) async fn set_agent_limit(
    pool: &PgPool,
    cancel: &CancellationToken,
    agent_id: Uuid,
    limit: Option<i32>,
) -> Result<(), CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update agents
           set max_concurrent_backups = $2
         where agent_id = $1
        returning agent_id
        "#,
    )
    .bind(agent_id)
    .bind(limit)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "set_agent_limit failed"))?;

    match row {
        Some(_) => Ok(()),
        None => Err(CoreError::not_found(format!("agent {agent_id}"))),
    }
}

/// Organization the agent is bound to; feeds the HTTP layer's org-scoped
/// authorization of agent endpoints.
pub(crate) async fn agent_org(
    pool: &PgPool,
    cancel: &CancellationToken,
    agent_id: Uuid,
) -> Result<Uuid, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> = sqlx::query_as("select org_id from agents where agent_id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| store_err(e, "agent_org failed"))?;

    match row {
        Some((org_id,)) => Ok(org_id),
        None => Err(CoreError::not_found(format!("agent {agent_id}"))),
    }
}

/// Organization a schedule resolves to, via its agent.
pub(crate) async fn schedule_org(
    pool: &PgPool,
    cancel: &CancellationToken,
    schedule_id: Uuid,
) -> Result<Uuid, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select a.org_id
        from schedules s
        join agents a on a.agent_id = s.agent_id
        where s.schedule_id = $1
        "#,
    )
    .bind(schedule_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| store_err(e, "schedule_org failed"))?;

    match row {
        Some((org_id,)) => Ok(org_id),
        None => Err(CoreError::not_found(format!("schedule {schedule_id}"))),
    }
}

/// Organization of a ledger row; `None` once the row is gone.
pub(crate) async fn running_org(
    pool: &PgPool,
    cancel: &CancellationToken,
    running_id: Uuid,
) -> Result<Option<Uuid>, CoreError> {
    ensure_live(cancel)?;

    let row: Option<(Uuid,)> =
        sqlx::query_as("select org_id from running_backups where running_id = $1")
            .bind(running_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| store_err(e, "running_org failed"))?;

    Ok(row.map(|(org_id,)| org_id))
}
