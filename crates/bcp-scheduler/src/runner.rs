//! The scheduler task and the per-org admission pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bcp_core::{
    plan_admissions, AdmittedJob, AgentSnapshot, CoreError, DispatchTransport, OrgPassLock as _,
    OrgSnapshot, QueueStore,
};
use bcp_schemas::QueueEvent;

use crate::wake::{SchedulerHandle, Wake, WakeReason};

/// Timing knobs for the loop.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Periodic safety-net tick. Liveness only; correctness never
    /// depends on it.
    pub tick_interval: Duration,
    /// Deadline for one org pass (snapshot + plan + admits).
    pub pass_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            pass_deadline: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Tight timings for the scenario suites.
    pub fn test_defaults() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            pass_deadline: Duration::from_secs(2),
        }
    }
}

/// What one pass did, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Another replica held the org's pass lock; nothing was attempted.
    pub skipped: bool,
    pub admitted: usize,
    /// The pass aborted early on a lost admission race and re-woke
    /// itself.
    pub aborted_on_limit: bool,
}

impl PassReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            admitted: 0,
            aborted_on_limit: false,
        }
    }
}

/// The scheduler: owns the wake receiver, drives passes, emits dispatch
/// notifications and `Admitted` events.
pub struct Scheduler {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn DispatchTransport>,
    config: SchedulerConfig,
    handle: SchedulerHandle,
    wake_rx: broadcast::Receiver<Wake>,
    events: Option<broadcast::Sender<QueueEvent>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn DispatchTransport>,
        config: SchedulerConfig,
    ) -> Self {
        let (tx, wake_rx) = broadcast::channel(1024);
        Self {
            store,
            transport,
            config,
            handle: SchedulerHandle::new(tx),
            wake_rx,
            events: None,
        }
    }

    /// Mirror admissions onto the daemon event bus.
    pub fn with_events(mut self, events: broadcast::Sender<QueueEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Spawn the scheduler task. The token stops the loop; an in-flight
    /// pass observes it only at its own suspension points, so committed
    /// admissions are never undone.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            deadline_ms = self.config.pass_deadline.as_millis() as u64,
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Dirty set with stable FIFO drain order for cross-org fairness.
        let mut dirty_order: VecDeque<Uuid> = VecDeque::new();
        let mut dirty: HashSet<Uuid> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
                wake = self.wake_rx.recv() => match wake {
                    Ok(w) => {
                        debug!(org_id = %w.org_id, reason = ?w.reason, "wake");
                        if dirty.insert(w.org_id) {
                            dirty_order.push_back(w.org_id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed wakes: fall back to discovery, same as a tick.
                        warn!(missed, "wake channel lagged; resyncing from store");
                        self.mark_all_queued(&cancel, &mut dirty, &mut dirty_order).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = ticker.tick() => {
                    self.mark_all_queued(&cancel, &mut dirty, &mut dirty_order).await;
                }
            }

            // Coalesce every wake that arrived while we were suspended.
            while let Ok(w) = self.wake_rx.try_recv() {
                if dirty.insert(w.org_id) {
                    dirty_order.push_back(w.org_id);
                }
            }

            while let Some(org_id) = dirty_order.pop_front() {
                dirty.remove(&org_id);
                if cancel.is_cancelled() {
                    return;
                }
                match self.pass(org_id, &cancel).await {
                    Ok(report) if report.skipped => {
                        debug!(org_id = %org_id, "pass skipped: lock held elsewhere");
                    }
                    Ok(report) => {
                        if report.admitted > 0 {
                            info!(org_id = %org_id, admitted = report.admitted, "pass complete");
                        }
                    }
                    Err(CoreError::Canceled) => return,
                    Err(CoreError::Timeout(ms)) => {
                        warn!(org_id = %org_id, deadline_ms = ms, "pass deadline expired; rescheduling");
                        self.handle.wake(org_id, WakeReason::Retry);
                    }
                    Err(e) => {
                        error!(org_id = %org_id, error = %e, "pass failed");
                    }
                }
            }
        }
    }

    async fn mark_all_queued(
        &self,
        cancel: &CancellationToken,
        dirty: &mut HashSet<Uuid>,
        dirty_order: &mut VecDeque<Uuid>,
    ) {
        match self.store.orgs_with_queued_entries(cancel).await {
            Ok(orgs) => {
                for org_id in orgs {
                    if dirty.insert(org_id) {
                        dirty_order.push_back(org_id);
                    }
                }
            }
            Err(CoreError::Canceled) => {}
            Err(e) => warn!(error = %e, "tick discovery failed"),
        }
    }

    /// One admission pass for `org_id`.
    ///
    /// Lock → snapshot → plan → admit, all under the pass deadline.
    /// Dispatch notices go out per entry, strictly after that entry's
    /// admitting transaction committed; agents never learn about a job
    /// the store has not recorded.
    pub async fn pass(
        &self,
        org_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PassReport, CoreError> {
        let Some(lock) = self.store.acquire_org_lock(cancel, org_id).await? else {
            return Ok(PassReport::skipped());
        };

        let outcome = match tokio::time::timeout(
            self.config.pass_deadline,
            self.pass_locked(org_id, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(self.config.pass_deadline.as_millis() as u64)),
        };

        // A release failure must not mask the pass outcome.
        if let Err(release_err) = lock.release().await {
            warn!(org_id = %org_id, error = %release_err, "pass lock release failed");
        }

        let (admitted, aborted_on_limit) = outcome?;

        Ok(PassReport {
            skipped: false,
            admitted,
            aborted_on_limit,
        })
    }

    /// Snapshot, plan, admit. Runs while holding the org pass lock.
    ///
    /// Each admission is notified immediately after its own transaction
    /// committed (the spawn holds nothing), so a deadline expiry or a
    /// store failure later in the pass can never orphan a committed
    /// admission.
    async fn pass_locked(
        &self,
        org_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(usize, bool), CoreError> {
        let queue = self.store.queued_jobs(cancel, org_id).await?;
        if queue.is_empty() {
            return Ok((0, false));
        }

        let org = OrgSnapshot {
            limit: self.store.get_org_limit(cancel, org_id).await?,
            running: self.store.count_running_by_org(cancel, org_id).await?,
        };

        let mut agents: HashMap<Uuid, AgentSnapshot> = HashMap::new();
        for job in &queue {
            if agents.contains_key(&job.agent_id) {
                continue;
            }
            let snapshot = AgentSnapshot {
                limit: self.store.get_agent_limit(cancel, job.agent_id).await?,
                running: self
                    .store
                    .count_running_by_agent(cancel, job.agent_id)
                    .await?,
            };
            agents.insert(job.agent_id, snapshot);
        }

        let plan = plan_admissions(&org, &queue, &agents);

        let mut admitted = 0usize;
        let mut aborted_on_limit = false;
        for entry_id in plan {
            match self.store.admit_atomic(cancel, entry_id).await {
                Ok(job) => {
                    admitted += 1;
                    self.dispatch(&job);
                }
                Err(CoreError::NotFound(_)) => {
                    // Canceled (or stolen) between snapshot and admit.
                    debug!(org_id = %org_id, entry_id = %entry_id, "planned entry vanished; skipping");
                }
                Err(CoreError::LimitViolated(msg)) => {
                    // Lost a race with another admitter: the snapshot is
                    // stale. Abort the rest of the pass and re-wake.
                    warn!(org_id = %org_id, entry_id = %entry_id, %msg, "admission refused; re-waking");
                    self.handle.wake(org_id, WakeReason::Retry);
                    aborted_on_limit = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((admitted, aborted_on_limit))
    }

    /// Post-commit, fire-and-forget dispatch notification. Failures are
    /// logged; the admission stands.
    fn dispatch(&self, job: &AdmittedJob) {
        if let Some(events) = &self.events {
            let _ = events.send(QueueEvent::Admitted {
                org_id: job.org_id,
                entry_id: job.entry_id,
                running_id: job.running_id,
                agent_id: job.agent_id,
            });
        }

        let transport = Arc::clone(&self.transport);
        let running_id = job.running_id;
        let agent_id = job.agent_id;
        tokio::spawn(async move {
            if let Err(e) = transport.notify_dispatch(running_id, agent_id).await {
                warn!(%running_id, %agent_id, error = %e, "dispatch notification failed; redelivery is a transport concern");
            }
        });
    }
}
