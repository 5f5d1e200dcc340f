//! In-memory `QueueStore` for the scenario suites.
//!
//! One `std::sync::Mutex` over the whole state makes every operation
//! atomic; the same observable contract as the Postgres store's
//! transactions. The mutex is never held across an await. Pass locks are
//! per-org `tokio::sync::Mutex` try-locks, mirroring the advisory-lock
//! semantics (the loser is told to skip, not to wait).
//!
//! Time is a monotonic counter over a fixed epoch so ordering tests are
//! reproducible; `queued_at` is strictly increasing per store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{
    canonical_cmp, ensure_live, AdmittedJob, CancelOutcome, CompleteOutcome, CoreError,
    NewQueueEntry, OrgPassLock, QueueStore, QueuedJob,
};
use bcp_schemas::{QueueEntryView, QueueSummary};

#[derive(Clone)]
struct OrgRow {
    limit: Option<i32>,
}

#[derive(Clone)]
struct AgentRow {
    org_id: Uuid,
    hostname: String,
    limit: Option<i32>,
}

#[derive(Clone)]
struct ScheduleRow {
    agent_id: Uuid,
    display_name: String,
    priority: i32,
}

#[derive(Clone)]
struct QueueRow {
    schedule_id: Uuid,
    job: QueuedJob,
}

#[derive(Clone)]
struct RunningRow {
    org_id: Uuid,
    agent_id: Uuid,
}

struct MemState {
    orgs: HashMap<Uuid, OrgRow>,
    agents: HashMap<Uuid, AgentRow>,
    schedules: HashMap<Uuid, ScheduleRow>,
    queue: HashMap<Uuid, QueueRow>,
    running: HashMap<Uuid, RunningRow>,
    ticks: i64,
}

impl MemState {
    /// Advance the store clock by one millisecond and return it.
    fn next_instant(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        epoch() + Duration::milliseconds(self.ticks)
    }

    fn now(&self) -> DateTime<Utc> {
        epoch() + Duration::milliseconds(self.ticks)
    }

    fn queued_for_org(&self, org_id: Uuid) -> Vec<QueueRow> {
        let mut rows: Vec<QueueRow> = self
            .queue
            .values()
            .filter(|r| r.job.org_id == org_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| canonical_cmp(&a.job, &b.job));
        rows
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// In-memory store double. Share behind an `Arc` between the scheduler,
/// the router under test, and the assertions.
pub struct MemStore {
    state: Mutex<MemState>,
    org_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                orgs: HashMap::new(),
                agents: HashMap::new(),
                schedules: HashMap::new(),
                queue: HashMap::new(),
                running: HashMap::new(),
                ticks: 0,
            }),
            org_locks: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().expect("mem store mutex poisoned")
    }

    // -- seeding -----------------------------------------------------------

    pub fn add_organization(&self, org_id: Uuid, limit: Option<i32>) {
        self.locked().orgs.insert(org_id, OrgRow { limit });
    }

    pub fn add_agent(&self, agent_id: Uuid, org_id: Uuid, hostname: &str, limit: Option<i32>) {
        self.locked().agents.insert(
            agent_id,
            AgentRow {
                org_id,
                hostname: hostname.to_string(),
                limit,
            },
        );
    }

    pub fn add_schedule(&self, schedule_id: Uuid, agent_id: Uuid, name: &str, priority: i32) {
        self.locked().schedules.insert(
            schedule_id,
            ScheduleRow {
                agent_id,
                display_name: name.to_string(),
                priority,
            },
        );
    }

    /// Current store clock, for assertions on timestamps.
    pub fn store_now(&self) -> DateTime<Utc> {
        self.locked().now()
    }
}

struct MemOrgPassLock {
    org_id: Uuid,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait]
impl OrgPassLock for MemOrgPassLock {
    fn org_id(&self) -> Uuid {
        self.org_id
    }

    async fn release(self: Box<Self>) -> Result<(), CoreError> {
        // Guard drop is the release.
        Ok(())
    }
}

#[async_trait]
impl QueueStore for MemStore {
    async fn enqueue(
        &self,
        cancel: &CancellationToken,
        entry: NewQueueEntry,
    ) -> Result<QueuedJob, CoreError> {
        ensure_live(cancel)?;
        let mut st = self.locked();

        if st.queue.contains_key(&entry.entry_id) {
            return Err(CoreError::conflict("enqueue failed"));
        }
        let Some(schedule) = st.schedules.get(&entry.schedule_id).cloned() else {
            return Err(CoreError::not_found(format!(
                "schedule {} does not exist",
                entry.schedule_id
            )));
        };
        let Some(agent) = st.agents.get(&schedule.agent_id).cloned() else {
            return Err(CoreError::not_found(format!(
                "agent {} does not exist",
                schedule.agent_id
            )));
        };

        let queued_at = st.next_instant();
        let job = QueuedJob {
            entry_id: entry.entry_id,
            org_id: agent.org_id,
            agent_id: schedule.agent_id,
            priority: entry.priority_override.unwrap_or(schedule.priority),
            queued_at,
        };
        st.queue.insert(
            entry.entry_id,
            QueueRow {
                schedule_id: entry.schedule_id,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn cancel_by_id(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        entry_id: Uuid,
    ) -> Result<CancelOutcome, CoreError> {
        ensure_live(cancel)?;
        let mut st = self.locked();

        match st.queue.get(&entry_id) {
            Some(row) if row.job.org_id == org_id => {
                st.queue.remove(&entry_id);
                Ok(CancelOutcome::Canceled)
            }
            // Absent, or another org's entry: the same no-op success.
            _ => Ok(CancelOutcome::NoOp),
        }
    }

    async fn list_queued_with_details(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueueEntryView>, CoreError> {
        ensure_live(cancel)?;
        let st = self.locked();

        let mut out = Vec::new();
        for (position, row) in st.queued_for_org(org_id).into_iter().enumerate() {
            let schedule = st
                .schedules
                .get(&row.schedule_id)
                .ok_or_else(|| CoreError::not_found("schedule for queued entry"))?;
            let agent = st
                .agents
                .get(&row.job.agent_id)
                .ok_or_else(|| CoreError::not_found("agent for queued entry"))?;

            out.push(QueueEntryView {
                id: row.job.entry_id,
                schedule_id: row.schedule_id,
                schedule_name: schedule.display_name.clone(),
                agent_id: row.job.agent_id,
                agent_hostname: agent.hostname.clone(),
                priority: row.job.priority,
                queue_position: position as i64 + 1,
                queued_at: row.job.queued_at,
            });
        }
        Ok(out)
    }

    async fn summary(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<QueueSummary, CoreError> {
        ensure_live(cancel)?;
        let st = self.locked();

        let queued = st.queued_for_org(org_id);
        let total_queued = queued.len() as i64;
        let total_running = st.running.values().filter(|r| r.org_id == org_id).count() as i64;

        let now = st.now();
        let avg_wait_minutes = if queued.is_empty() {
            0.0
        } else {
            let total_ms: i64 = queued
                .iter()
                .map(|r| (now - r.job.queued_at).num_milliseconds())
                .sum();
            (total_ms as f64 / queued.len() as f64) / 60_000.0
        };
        let oldest_queued_at = queued.iter().map(|r| r.job.queued_at).min();

        let queued_by_agent = if queued.is_empty() {
            None
        } else {
            let mut by_agent: BTreeMap<Uuid, i64> = BTreeMap::new();
            for row in &queued {
                *by_agent.entry(row.job.agent_id).or_insert(0) += 1;
            }
            Some(by_agent)
        };

        Ok(QueueSummary {
            total_queued,
            total_running,
            avg_wait_minutes,
            oldest_queued_at,
            queued_by_agent,
        })
    }

    async fn peek_next(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<QueuedJob>, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .queued_for_org(org_id)
            .into_iter()
            .next()
            .map(|r| r.job))
    }

    async fn queued_jobs(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueuedJob>, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .queued_for_org(org_id)
            .into_iter()
            .map(|r| r.job)
            .collect())
    }

    async fn admit_atomic(
        &self,
        cancel: &CancellationToken,
        entry_id: Uuid,
    ) -> Result<AdmittedJob, CoreError> {
        ensure_live(cancel)?;
        let mut st = self.locked();

        let Some(row) = st.queue.get(&entry_id).cloned() else {
            return Err(CoreError::not_found(format!(
                "queue entry {entry_id} no longer exists"
            )));
        };
        let job = row.job;

        // Limit re-check against current in-flight counts; same rules,
        // same instant as the removal below, by virtue of the state mutex.
        let org_limit = st.orgs.get(&job.org_id).and_then(|o| o.limit);
        let agent_limit = st.agents.get(&job.agent_id).and_then(|a| a.limit);
        let org_running = st.running.values().filter(|r| r.org_id == job.org_id).count() as i64;
        let agent_running = st
            .running
            .values()
            .filter(|r| r.agent_id == job.agent_id)
            .count() as i64;

        if let Some(limit) = org_limit {
            if org_running + 1 > i64::from(limit) {
                return Err(CoreError::limit_violated(format!(
                    "org {}: {org_running} running, limit {limit}",
                    job.org_id
                )));
            }
        }
        if let Some(limit) = agent_limit {
            if agent_running + 1 > i64::from(limit) {
                return Err(CoreError::limit_violated(format!(
                    "agent {}: {agent_running} running, limit {limit}",
                    job.agent_id
                )));
            }
        }

        st.queue.remove(&entry_id);
        let started_at = st.next_instant();
        let running_id = Uuid::new_v4();
        st.running.insert(
            running_id,
            RunningRow {
                org_id: job.org_id,
                agent_id: job.agent_id,
            },
        );

        Ok(AdmittedJob {
            running_id,
            entry_id,
            schedule_id: row.schedule_id,
            org_id: job.org_id,
            agent_id: job.agent_id,
            started_at,
        })
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<CompleteOutcome, CoreError> {
        ensure_live(cancel)?;
        let mut st = self.locked();
        Ok(match st.running.remove(&running_id) {
            Some(_) => CompleteOutcome::Completed,
            None => CompleteOutcome::NoOp,
        })
    }

    async fn count_running_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .running
            .values()
            .filter(|r| r.org_id == org_id)
            .count() as i64)
    }

    async fn count_running_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .running
            .values()
            .filter(|r| r.agent_id == agent_id)
            .count() as i64)
    }

    async fn count_queued_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .queue
            .values()
            .filter(|r| r.job.org_id == org_id)
            .count() as i64)
    }

    async fn count_queued_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .queue
            .values()
            .filter(|r| r.job.agent_id == agent_id)
            .count() as i64)
    }

    async fn get_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        ensure_live(cancel)?;
        match self.locked().orgs.get(&org_id) {
            Some(org) => Ok(org.limit),
            None => Err(CoreError::not_found(format!("organization {org_id}"))),
        }
    }

    async fn set_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        ensure_live(cancel)?;
        match self.locked().orgs.get_mut(&org_id) {
            Some(org) => {
                org.limit = limit;
                Ok(())
            }
            None => Err(CoreError::not_found(format!("organization {org_id}"))),
        }
    }

    async fn get_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        ensure_live(cancel)?;
        match self.locked().agents.get(&agent_id) {
            Some(agent) => Ok(agent.limit),
            None => Err(CoreError::not_found(format!("agent {agent_id}"))),
        }
    }

    async fn set_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        ensure_live(cancel)?;
        match self.locked().agents.get_mut(&agent_id) {
            Some(agent) => {
                agent.limit = limit;
                Ok(())
            }
            None => Err(CoreError::not_found(format!("agent {agent_id}"))),
        }
    }

    async fn agent_org(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        ensure_live(cancel)?;
        match self.locked().agents.get(&agent_id) {
            Some(agent) => Ok(agent.org_id),
            None => Err(CoreError::not_found(format!("agent {agent_id}"))),
        }
    }

    async fn schedule_org(
        &self,
        cancel: &CancellationToken,
        schedule_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        ensure_live(cancel)?;
        let st = self.locked();
        let Some(schedule) = st.schedules.get(&schedule_id) else {
            return Err(CoreError::not_found(format!("schedule {schedule_id}")));
        };
        match st.agents.get(&schedule.agent_id) {
            Some(agent) => Ok(agent.org_id),
            None => Err(CoreError::not_found(format!(
                "agent {} does not exist",
                schedule.agent_id
            ))),
        }
    }

    async fn running_org(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<Option<Uuid>, CoreError> {
        ensure_live(cancel)?;
        Ok(self
            .locked()
            .running
            .get(&running_id)
            .map(|r| r.org_id))
    }

    async fn acquire_org_lock(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<Box<dyn OrgPassLock>>, CoreError> {
        ensure_live(cancel)?;
        let lock = {
            let mut locks = self.org_locks.lock().expect("org lock map poisoned");
            Arc::clone(locks.entry(org_id).or_default())
        };
        match lock.try_lock_owned() {
            Ok(guard) => Ok(Some(Box::new(MemOrgPassLock {
                org_id,
                _guard: guard,
            }))),
            Err(_) => Ok(None),
        }
    }

    async fn orgs_with_queued_entries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, CoreError> {
        ensure_live(cancel)?;
        let st = self.locked();
        let mut orgs: Vec<Uuid> = st.queue.values().map(|r| r.job.org_id).collect();
        orgs.sort();
        orgs.dedup();
        Ok(orgs)
    }
}
