//! Effective concurrency resolution for orgs and agents.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::CoreError;
use crate::store::QueueStore;

/// Effective concurrency state of an organization.
#[derive(Debug, Clone, Copy)]
pub struct OrgConcurrency {
    /// `None` = unlimited, `Some(0)` = paused.
    pub limit: Option<i32>,
    pub running: i64,
    pub queued: i64,
}

/// Effective concurrency state of an agent. `queued` counts queued
/// entries whose schedule targets this agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentConcurrency {
    pub limit: Option<i32>,
    pub running: i64,
    pub queued: i64,
}

/// Reject negative limit values before they reach the store. `None` is
/// the unlimited sentinel and is distinct from zero (pause).
pub fn validate_limit(value: Option<i32>) -> Result<(), CoreError> {
    match value {
        Some(v) if v < 0 => Err(CoreError::invalid(format!(
            "max_concurrent_backups must be >= 0 or null, got {v}"
        ))),
        _ => Ok(()),
    }
}

/// Composes limit and count reads into effective concurrency views.
/// Borrows the store; holds no state of its own.
pub struct LimitResolver<'a> {
    store: &'a dyn QueueStore,
}

impl<'a> LimitResolver<'a> {
    pub fn new(store: &'a dyn QueueStore) -> Self {
        Self { store }
    }

    pub async fn effective_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<OrgConcurrency, CoreError> {
        let limit = self.store.get_org_limit(cancel, org_id).await?;
        let running = self.store.count_running_by_org(cancel, org_id).await?;
        let queued = self.store.count_queued_by_org(cancel, org_id).await?;
        Ok(OrgConcurrency {
            limit,
            running,
            queued,
        })
    }

    pub async fn effective_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<AgentConcurrency, CoreError> {
        let limit = self.store.get_agent_limit(cancel, agent_id).await?;
        let running = self.store.count_running_by_agent(cancel, agent_id).await?;
        let queued = self.store.count_queued_by_agent(cancel, agent_id).await?;
        Ok(AgentConcurrency {
            limit,
            running,
            queued,
        })
    }
}
