//! bcp-store
//!
//! Postgres implementation of the `QueueStore` contract: durable queue
//! custody, the dispatch ledger, concurrency limits, and the advisory
//! pass lock. All SQL lives here; the admission semantics it must honor
//! live in `bcp-core`.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "BCP_DATABASE_URL";

mod ledger;
mod limits;
mod locks;
mod queue;

pub use locks::PgOrgPassLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use bcp_core::{
    AdmittedJob, CancelOutcome, CompleteOutcome, CoreError, NewQueueEntry, OrgPassLock, QueueStore,
    QueuedJob,
};
use bcp_schemas::{QueueEntryView, QueueSummary};

/// Pool size for the daemon. The scheduler holds at most one dedicated
/// connection per in-flight pass lock; the rest serve HTTP reads.
const POOL_SIZE: u32 = 10;

/// Open a pool against the URL in `BCP_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("{ENV_DB_URL} is not set"))?;
    connect(&url).await
}

/// Open a pool against an explicit URL.
pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .connect(url)
        .await
        .context("Postgres connection failed")
}

/// Bring the schema up to date from the embedded migration set.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("schema migration failed")
}

/// Pool for the integration suites: `BCP_DATABASE_URL` plus a migration
/// pass, so every scenario starts on a current schema.
pub async fn migrated_test_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Map a sqlx failure into the core taxonomy. Unique violations become
/// `Conflict`; everything else is a `Store` error carrying `what` as
/// context.
pub(crate) fn store_err(e: sqlx::Error, what: &'static str) -> CoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
            return CoreError::conflict(what);
        }
    }
    CoreError::Store(anyhow::Error::new(e).context(what))
}

// ---------------------------------------------------------------------------
// Provisioning (onboarding collaborator + test suites)
// ---------------------------------------------------------------------------
// Org/agent/schedule lifecycle is owned externally; the store only offers
// idempotent upserts so onboarding and the scenario suites can seed state.

#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub org_id: Uuid,
    pub name: String,
    pub max_concurrent_backups: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewAgent {
    pub agent_id: Uuid,
    pub org_id: Uuid,
    pub hostname: String,
    pub max_concurrent_backups: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub schedule_id: Uuid,
    pub agent_id: Uuid,
    pub display_name: String,
    pub priority: i32,
}

pub async fn upsert_organization(pool: &PgPool, org: &NewOrganization) -> Result<()> {
    sqlx::query(
        r#"
        insert into organizations (org_id, name, max_concurrent_backups)
        values ($1, $2, $3)
        on conflict (org_id) do update
            set name                   = excluded.name,
                max_concurrent_backups = excluded.max_concurrent_backups
        "#,
    )
    .bind(org.org_id)
    .bind(&org.name)
    .bind(org.max_concurrent_backups)
    .execute(pool)
    .await
    .context("upsert_organization failed")?;
    Ok(())
}

pub async fn upsert_agent(pool: &PgPool, agent: &NewAgent) -> Result<()> {
    sqlx::query(
        r#"
        insert into agents (agent_id, org_id, hostname, max_concurrent_backups)
        values ($1, $2, $3, $4)
        on conflict (agent_id) do update
            set hostname               = excluded.hostname,
                max_concurrent_backups = excluded.max_concurrent_backups
        "#,
    )
    .bind(agent.agent_id)
    .bind(agent.org_id)
    .bind(&agent.hostname)
    .bind(agent.max_concurrent_backups)
    .execute(pool)
    .await
    .context("upsert_agent failed")?;
    Ok(())
}

pub async fn upsert_schedule(pool: &PgPool, schedule: &NewSchedule) -> Result<()> {
    sqlx::query(
        r#"
        insert into schedules (schedule_id, agent_id, display_name, priority)
        values ($1, $2, $3, $4)
        on conflict (schedule_id) do update
            set display_name = excluded.display_name,
                priority     = excluded.priority
        "#,
    )
    .bind(schedule.schedule_id)
    .bind(schedule.agent_id)
    .bind(&schedule.display_name)
    .bind(schedule.priority)
    .execute(pool)
    .await
    .context("upsert_schedule failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// PgQueueStore
// ---------------------------------------------------------------------------

/// Postgres-backed `QueueStore`. Cheap to clone; all state is the pool.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(
        &self,
        cancel: &CancellationToken,
        entry: NewQueueEntry,
    ) -> Result<QueuedJob, CoreError> {
        queue::enqueue(&self.pool, cancel, entry).await
    }

    async fn cancel_by_id(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        entry_id: Uuid,
    ) -> Result<CancelOutcome, CoreError> {
        queue::cancel_by_id(&self.pool, cancel, org_id, entry_id).await
    }

    async fn list_queued_with_details(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueueEntryView>, CoreError> {
        queue::list_queued_with_details(&self.pool, cancel, org_id).await
    }

    async fn summary(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<QueueSummary, CoreError> {
        queue::summary(&self.pool, cancel, org_id).await
    }

    async fn peek_next(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<QueuedJob>, CoreError> {
        queue::peek_next(&self.pool, cancel, org_id).await
    }

    async fn queued_jobs(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueuedJob>, CoreError> {
        queue::queued_jobs(&self.pool, cancel, org_id).await
    }

    async fn admit_atomic(
        &self,
        cancel: &CancellationToken,
        entry_id: Uuid,
    ) -> Result<AdmittedJob, CoreError> {
        ledger::admit_atomic(&self.pool, cancel, entry_id).await
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<CompleteOutcome, CoreError> {
        ledger::complete(&self.pool, cancel, running_id).await
    }

    async fn count_running_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        ledger::count_running_by_org(&self.pool, cancel, org_id).await
    }

    async fn count_running_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        ledger::count_running_by_agent(&self.pool, cancel, agent_id).await
    }

    async fn count_queued_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        queue::count_queued_by_org(&self.pool, cancel, org_id).await
    }

    async fn count_queued_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        queue::count_queued_by_agent(&self.pool, cancel, agent_id).await
    }

    async fn get_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        limits::get_org_limit(&self.pool, cancel, org_id).await
    }

    async fn set_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        limits::set_org_limit(&self.pool, cancel, org_id, limit).await
    }

    async fn get_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        limits::get_agent_limit(&self.pool, cancel, agent_id).await
    }

    async fn set_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        limits::set_agent_limit(&self.pool, cancel, agent_id, limit).await
    }

    async fn agent_org(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        limits::agent_org(&self.pool, cancel, agent_id).await
    }

    async fn schedule_org(
        &self,
        cancel: &CancellationToken,
        schedule_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        limits::schedule_org(&self.pool, cancel, schedule_id).await
    }

    async fn running_org(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<Option<Uuid>, CoreError> {
        limits::running_org(&self.pool, cancel, running_id).await
    }

    async fn acquire_org_lock(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<Box<dyn OrgPassLock>>, CoreError> {
        locks::acquire_org_lock(&self.pool, cancel, org_id).await
    }

    async fn orgs_with_queued_entries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, CoreError> {
        queue::orgs_with_queued_entries(&self.pool, cancel).await
    }
}
