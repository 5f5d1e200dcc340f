//! Scenario: A Slow Store Trips The Pass Deadline
//!
//! # Invariant under test
//! A pass that cannot finish inside its deadline fails `Timeout` without
//! admitting anything, and the pass lock is released so the next attempt
//! can run. The scheduler loop logs and reschedules; nothing is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{
    AdmittedJob, CancelOutcome, CompleteOutcome, CoreError, NewQueueEntry, OrgPassLock,
    QueueStore, QueuedJob,
};
use bcp_scheduler::{Scheduler, SchedulerConfig};
use bcp_testkit::{MemStore, RecordingTransport};

/// Delegating store whose reads stall long enough to blow any small
/// deadline. Only the operations the pass touches are slowed.
struct SlowStore {
    inner: Arc<MemStore>,
    delay: Duration,
}

#[async_trait]
impl QueueStore for SlowStore {
    async fn enqueue(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        entry: NewQueueEntry,
    ) -> Result<QueuedJob, CoreError> {
        self.inner.enqueue(cancel, entry).await
    }

    async fn cancel_by_id(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        entry_id: Uuid,
    ) -> Result<CancelOutcome, CoreError> {
        self.inner.cancel_by_id(cancel, org_id, entry_id).await
    }

    async fn list_queued_with_details(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<bcp_schemas::QueueEntryView>, CoreError> {
        self.inner.list_queued_with_details(cancel, org_id).await
    }

    async fn summary(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<bcp_schemas::QueueSummary, CoreError> {
        self.inner.summary(cancel, org_id).await
    }

    async fn peek_next(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<QueuedJob>, CoreError> {
        self.inner.peek_next(cancel, org_id).await
    }

    async fn queued_jobs(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Vec<QueuedJob>, CoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.queued_jobs(cancel, org_id).await
    }

    async fn admit_atomic(
        &self,
        cancel: &CancellationToken,
        entry_id: Uuid,
    ) -> Result<AdmittedJob, CoreError> {
        self.inner.admit_atomic(cancel, entry_id).await
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<CompleteOutcome, CoreError> {
        self.inner.complete(cancel, running_id).await
    }

    async fn count_running_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        self.inner.count_running_by_org(cancel, org_id).await
    }

    async fn count_running_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        self.inner.count_running_by_agent(cancel, agent_id).await
    }

    async fn count_queued_by_org(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<i64, CoreError> {
        self.inner.count_queued_by_org(cancel, org_id).await
    }

    async fn count_queued_by_agent(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<i64, CoreError> {
        self.inner.count_queued_by_agent(cancel, agent_id).await
    }

    async fn get_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        self.inner.get_org_limit(cancel, org_id).await
    }

    async fn set_org_limit(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        self.inner.set_org_limit(cancel, org_id, limit).await
    }

    async fn get_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Option<i32>, CoreError> {
        self.inner.get_agent_limit(cancel, agent_id).await
    }

    async fn set_agent_limit(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
        limit: Option<i32>,
    ) -> Result<(), CoreError> {
        self.inner.set_agent_limit(cancel, agent_id, limit).await
    }

    async fn agent_org(
        &self,
        cancel: &CancellationToken,
        agent_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        self.inner.agent_org(cancel, agent_id).await
    }

    async fn schedule_org(
        &self,
        cancel: &CancellationToken,
        schedule_id: Uuid,
    ) -> Result<Uuid, CoreError> {
        self.inner.schedule_org(cancel, schedule_id).await
    }

    async fn running_org(
        &self,
        cancel: &CancellationToken,
        running_id: Uuid,
    ) -> Result<Option<Uuid>, CoreError> {
        self.inner.running_org(cancel, running_id).await
    }

    async fn acquire_org_lock(
        &self,
        cancel: &CancellationToken,
        org_id: Uuid,
    ) -> Result<Option<Box<dyn OrgPassLock>>, CoreError> {
        self.inner.acquire_org_lock(cancel, org_id).await
    }

    async fn orgs_with_queued_entries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, CoreError> {
        self.inner.orgs_with_queued_entries(cancel).await
    }
}

#[tokio::test]
async fn deadline_expiry_fails_timeout_and_frees_the_lock() {
    let mem = Arc::new(MemStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let org_id = Uuid::from_u128(1);
    let agent_id = Uuid::from_u128(2);
    let schedule_id = Uuid::from_u128(3);
    mem.add_organization(org_id, None);
    mem.add_agent(agent_id, org_id, "db01.acme.internal", None);
    mem.add_schedule(schedule_id, agent_id, "nightly-pg", 0);

    let cancel = CancellationToken::new();
    mem.enqueue(
        &cancel,
        NewQueueEntry {
            entry_id: Uuid::from_u128(10),
            schedule_id,
            priority_override: None,
        },
    )
    .await
    .expect("enqueue");

    let slow = Arc::new(SlowStore {
        inner: Arc::clone(&mem),
        delay: Duration::from_millis(200),
    });
    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(3600),
        pass_deadline: Duration::from_millis(20),
    };
    let scheduler = Scheduler::new(slow as Arc<dyn QueueStore>, Arc::clone(&transport) as _, config);

    let result = scheduler.pass(org_id, &cancel).await;
    assert!(
        matches!(result, Err(CoreError::Timeout(_))),
        "slow snapshot must trip the deadline, got {result:?}"
    );
    assert_eq!(
        mem.count_running_by_org(&cancel, org_id).await.unwrap(),
        0,
        "nothing admits on a timed-out pass"
    );
    assert_eq!(transport.count(), 0);

    // The pass lock was released on the timeout path: a direct follow-up
    // acquire succeeds.
    let guard = mem
        .acquire_org_lock(&cancel, org_id)
        .await
        .expect("acquire")
        .expect("lock must be free after a timed-out pass");
    guard.release().await.expect("release");
}
