//! Scenario: Single-Org Cap
//!
//! # Invariant under test
//! Org limit 2, no running entries, three equal-priority entries on three
//! unlimited agents: one pass admits the first two in canonical order
//! (queue positions 1 and 2); the third remains queued at position 1.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{NewQueueEntry, QueueStore};
use bcp_scheduler::{Scheduler, SchedulerConfig};
use bcp_testkit::{MemStore, RecordingTransport};

#[tokio::test]
async fn one_pass_admits_up_to_the_org_cap() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let org_id = Uuid::from_u128(1);
    store.add_organization(org_id, Some(2));

    let mut schedules = Vec::new();
    for (n, hostname) in ["db01", "db02", "db03"].iter().enumerate() {
        let agent_id = Uuid::from_u128(0xA0 + n as u128);
        let schedule_id = Uuid::from_u128(0x50 + n as u128);
        store.add_agent(agent_id, org_id, hostname, None);
        store.add_schedule(schedule_id, agent_id, "nightly", 0);
        schedules.push(schedule_id);
    }

    let cancel = CancellationToken::new();
    // Same priority; the store clock makes queued_at strictly increasing,
    // so enqueue order is canonical order.
    let entries = [
        Uuid::from_u128(101),
        Uuid::from_u128(102),
        Uuid::from_u128(103),
    ];
    for (entry_id, schedule_id) in entries.iter().zip(&schedules) {
        store
            .enqueue(
                &cancel,
                NewQueueEntry {
                    entry_id: *entry_id,
                    schedule_id: *schedule_id,
                    priority_override: Some(5),
                },
            )
            .await
            .expect("enqueue");
    }

    let listed = store
        .list_queued_with_details(&cancel, org_id)
        .await
        .expect("list");
    assert_eq!(
        listed.iter().map(|e| e.id).collect::<Vec<_>>(),
        entries.to_vec()
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        Arc::clone(&transport) as _,
        SchedulerConfig::test_defaults(),
    );
    let report = scheduler.pass(org_id, &cancel).await.expect("pass");
    assert_eq!(report.admitted, 2);

    let remaining = store
        .list_queued_with_details(&cancel, org_id)
        .await
        .expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, entries[2], "the newest entry remains");
    assert_eq!(remaining[0].queue_position, 1);

    let summary = store.summary(&cancel, org_id).await.expect("summary");
    assert_eq!(summary.total_running, 2);
    assert_eq!(summary.total_queued, 1);

    // A second pass admits nothing: the cap is consumed.
    let report = scheduler.pass(org_id, &cancel).await.expect("pass");
    assert_eq!(report.admitted, 0);
}
