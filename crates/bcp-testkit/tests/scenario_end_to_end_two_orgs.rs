//! Scenario: Two Orgs Drain Independently Under One Scheduler
//!
//! # Invariant under test
//! Cross-org isolation end to end: each org's cap constrains only its own
//! queue, completions free capacity for the right org, and the scheduler
//! loop (wakes + tick) drains both queues to empty without ever exceeding
//! either limit.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bcp_core::{NewQueueEntry, QueueStore};
use bcp_scheduler::{Scheduler, SchedulerConfig};
use bcp_testkit::{MemStore, RecordingTransport};

struct Org {
    org_id: Uuid,
    schedule_id: Uuid,
}

fn seed_org(store: &MemStore, n: u128, limit: Option<i32>) -> Org {
    let org_id = Uuid::from_u128(n);
    let agent_id = Uuid::from_u128(0xA0 + n);
    let schedule_id = Uuid::from_u128(0x50 + n);
    store.add_organization(org_id, limit);
    store.add_agent(agent_id, org_id, "db01.acme.internal", None);
    store.add_schedule(schedule_id, agent_id, "nightly-pg", 0);
    Org {
        org_id,
        schedule_id,
    }
}

#[tokio::test]
async fn both_orgs_drain_without_breaching_their_caps() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(RecordingTransport::new());

    let alpha = seed_org(&store, 1, Some(1));
    let beta = seed_org(&store, 2, Some(2));

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        Arc::clone(&transport) as _,
        SchedulerConfig::test_defaults(),
    );
    let handle = scheduler.handle();

    let cancel = CancellationToken::new();
    let task = scheduler.spawn(cancel.clone());

    const JOBS_PER_ORG: u128 = 4;
    for org in [&alpha, &beta] {
        for n in 0..JOBS_PER_ORG {
            store
                .enqueue(
                    &cancel,
                    NewQueueEntry {
                        entry_id: Uuid::from_u128(org.org_id.as_u128() * 1000 + n),
                        schedule_id: org.schedule_id,
                        priority_override: None,
                    },
                )
                .await
                .expect("enqueue");
        }
        handle.notify_enqueued(org.org_id);
    }

    // Drain: complete every dispatch as it arrives, until both queues are
    // empty. The cap invariant is asserted at every step.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut completed = 0usize;
    let mut seen = 0usize;
    while completed < (JOBS_PER_ORG as usize) * 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "drain did not finish in time; completed={completed}"
        );

        tokio::time::timeout(Duration::from_secs(5), transport.wait_for(seen + 1))
            .await
            .expect("next dispatch");
        let notices = transport.notices();

        for notice in notices.iter().skip(seen) {
            let running_alpha = store
                .count_running_by_org(&cancel, alpha.org_id)
                .await
                .unwrap();
            let running_beta = store
                .count_running_by_org(&cancel, beta.org_id)
                .await
                .unwrap();
            assert!(running_alpha <= 1, "alpha cap breached: {running_alpha}");
            assert!(running_beta <= 2, "beta cap breached: {running_beta}");

            store
                .complete(&cancel, notice.running_id)
                .await
                .expect("complete");
            completed += 1;
        }
        seen = notices.len();
    }

    // Everything drained.
    for org in [&alpha, &beta] {
        assert_eq!(
            store.count_queued_by_org(&cancel, org.org_id).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .count_running_by_org(&cancel, org.org_id)
                .await
                .unwrap(),
            0
        );
    }

    cancel.cancel();
    let _ = task.await;
}
