//! Scenario: Lifting A Limit Drains The Queue In One Pass
//!
//! # Invariant under test
//! Setting an org limit to unlimited (`null`) after a restrictive limit,
//! followed by a limit-change wake, admits every eligible queued entry in
//! a single pass, subject only to agent limits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{NewQueueEntry, QueueStore};
use bcp_scheduler::{Scheduler, SchedulerConfig};
use bcp_testkit::{MemStore, RecordingTransport};

#[tokio::test]
async fn unlimited_promotion_admits_all_eligible_entries() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let org_id = Uuid::from_u128(1);
    let agent_open = Uuid::from_u128(0xA);
    let agent_capped = Uuid::from_u128(0xB);
    let schedule_open = Uuid::from_u128(0x5A);
    let schedule_capped = Uuid::from_u128(0x5B);

    store.add_organization(org_id, Some(1));
    store.add_agent(agent_open, org_id, "db01.acme.internal", None);
    store.add_agent(agent_capped, org_id, "db02.acme.internal", Some(1));
    store.add_schedule(schedule_open, agent_open, "nightly-pg", 0);
    store.add_schedule(schedule_capped, agent_capped, "hourly-files", 0);

    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(3600),
        pass_deadline: Duration::from_secs(2),
    };
    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        Arc::clone(&transport) as _,
        config,
    );
    let handle = scheduler.handle();

    let cancel = CancellationToken::new();
    let task = scheduler.spawn(cancel.clone());

    // Four on the open agent, two on the capped agent.
    for n in 0..4u128 {
        store
            .enqueue(
                &cancel,
                NewQueueEntry {
                    entry_id: Uuid::from_u128(100 + n),
                    schedule_id: schedule_open,
                    priority_override: None,
                },
            )
            .await
            .expect("enqueue");
    }
    for n in 0..2u128 {
        store
            .enqueue(
                &cancel,
                NewQueueEntry {
                    entry_id: Uuid::from_u128(200 + n),
                    schedule_id: schedule_capped,
                    priority_override: None,
                },
            )
            .await
            .expect("enqueue");
    }

    // Under limit 1 exactly one admission happens.
    handle.notify_enqueued(org_id);
    tokio::time::timeout(Duration::from_secs(5), transport.wait_for(1))
        .await
        .expect("first admission");
    assert_eq!(store.count_queued_by_org(&cancel, org_id).await.unwrap(), 5);

    // Promote to unlimited and wake: everything eligible drains. The
    // capped agent contributes at most one more (limit 1, nothing running
    // on it yet unless the first admission landed there).
    store
        .set_org_limit(&cancel, org_id, None)
        .await
        .expect("promote");
    handle.notify_limit_changed(org_id);

    tokio::time::timeout(Duration::from_secs(5), transport.wait_for(5))
        .await
        .expect("promotion must drain the open agent");

    assert_eq!(
        store
            .count_running_by_agent(&cancel, agent_open)
            .await
            .unwrap(),
        4
    );
    assert_eq!(
        store
            .count_running_by_agent(&cancel, agent_capped)
            .await
            .unwrap(),
        1,
        "the capped agent must stay at its limit"
    );
    assert_eq!(
        store.count_queued_by_org(&cancel, org_id).await.unwrap(),
        1,
        "one entry stays queued behind the capped agent"
    );

    cancel.cancel();
    let _ = task.await;
}
