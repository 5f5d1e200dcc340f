//! Property-based tests for the admission planner.
//!
//! Invariants under test:
//! - No plan ever exceeds the org limit or any agent limit.
//! - Planning is deterministic for a given snapshot.
//! - Canonical sorting yields a total order whose 1-indexed ranks are the
//!   queue positions.
//! - A saturated agent never starves later entries on agents that still
//!   have capacity.

use std::collections::HashMap;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use bcp_core::{canonical_cmp, plan_admissions, AgentSnapshot, OrgSnapshot, QueuedJob};

const AGENT_POOL: u128 = 4;

fn agent_id(ix: u128) -> Uuid {
    Uuid::from_u128(0xA000 + ix)
}

/// One generated queue entry: (agent index, priority, queued offset secs).
fn arb_job() -> impl Strategy<Value = (u128, i32, i64)> {
    (0..AGENT_POOL, 0..10i32, 0..1_000i64)
}

fn build_queue(raw: &[(u128, i32, i64)]) -> Vec<QueuedJob> {
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let mut queue: Vec<QueuedJob> = raw
        .iter()
        .enumerate()
        .map(|(n, (agent, priority, offset))| QueuedJob {
            entry_id: Uuid::from_u128(n as u128 + 1),
            org_id: Uuid::from_u128(1),
            agent_id: agent_id(*agent),
            priority: *priority,
            queued_at: base + Duration::seconds(*offset),
        })
        .collect();
    queue.sort_by(canonical_cmp);
    queue
}

fn build_agents(limits: &[Option<i32>], running: &[i64]) -> HashMap<Uuid, AgentSnapshot> {
    (0..AGENT_POOL)
        .map(|ix| {
            (
                agent_id(ix),
                AgentSnapshot {
                    limit: limits[ix as usize],
                    running: running[ix as usize],
                },
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn plan_never_exceeds_org_limit(
        raw in proptest::collection::vec(arb_job(), 0..40),
        org_limit in 0..6i32,
        org_running in 0..6i64,
    ) {
        let queue = build_queue(&raw);
        let org = OrgSnapshot { limit: Some(org_limit), running: org_running };
        let accepted = plan_admissions(&org, &queue, &HashMap::new());

        let cap = (i64::from(org_limit) - org_running).max(0);
        prop_assert!(accepted.len() as i64 <= cap);
    }

    #[test]
    fn plan_never_exceeds_agent_limits(
        raw in proptest::collection::vec(arb_job(), 0..40),
        limits in proptest::collection::vec(proptest::option::of(0..3i32), AGENT_POOL as usize..=AGENT_POOL as usize),
        running in proptest::collection::vec(0..3i64, AGENT_POOL as usize..=AGENT_POOL as usize),
    ) {
        let queue = build_queue(&raw);
        let agents = build_agents(&limits, &running);
        let org = OrgSnapshot { limit: None, running: 0 };
        let accepted = plan_admissions(&org, &queue, &agents);

        let mut admitted_per_agent: HashMap<Uuid, i64> = HashMap::new();
        for id in &accepted {
            let job = queue.iter().find(|j| j.entry_id == *id).unwrap();
            *admitted_per_agent.entry(job.agent_id).or_insert(0) += 1;
        }
        for (agent, snap) in &agents {
            if let Some(limit) = snap.limit {
                let admitted = admitted_per_agent.get(agent).copied().unwrap_or(0);
                prop_assert!(
                    snap.running + admitted <= i64::from(limit),
                    "agent {agent} over limit: running={} admitted={admitted} limit={limit}",
                    snap.running
                );
            }
        }
    }

    #[test]
    fn plan_is_deterministic(
        raw in proptest::collection::vec(arb_job(), 0..40),
        org_limit in proptest::option::of(0..6i32),
        limits in proptest::collection::vec(proptest::option::of(0..3i32), AGENT_POOL as usize..=AGENT_POOL as usize),
    ) {
        let queue = build_queue(&raw);
        let agents = build_agents(&limits, &[0, 0, 0, 0]);
        let org = OrgSnapshot { limit: org_limit, running: 0 };

        let first = plan_admissions(&org, &queue, &agents);
        let second = plan_admissions(&org, &queue, &agents);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn canonical_sort_is_a_total_order(raw in proptest::collection::vec(arb_job(), 0..40)) {
        let queue = build_queue(&raw);
        for pair in queue.windows(2) {
            let ord = canonical_cmp(&pair[0], &pair[1]);
            prop_assert!(ord != std::cmp::Ordering::Greater);
            // Entry ids are unique, so equal elements are impossible.
            prop_assert!(ord != std::cmp::Ordering::Equal);
        }
    }

    #[test]
    fn saturated_agent_does_not_starve_others(
        blocked_depth in 1..10usize,
    ) {
        // `blocked_depth` entries on a saturated agent ahead of one entry
        // on an unlimited agent: the unlimited agent's entry must admit.
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let saturated = agent_id(0);
        let open = agent_id(1);

        let mut queue: Vec<QueuedJob> = (0..blocked_depth)
            .map(|n| QueuedJob {
                entry_id: Uuid::from_u128(n as u128 + 1),
                org_id: Uuid::from_u128(1),
                agent_id: saturated,
                priority: 9,
                queued_at: base + Duration::seconds(n as i64),
            })
            .collect();
        queue.push(QueuedJob {
            entry_id: Uuid::from_u128(0xEE),
            org_id: Uuid::from_u128(1),
            agent_id: open,
            priority: 0,
            queued_at: base + Duration::seconds(10_000),
        });
        queue.sort_by(canonical_cmp);

        let mut agents = HashMap::new();
        agents.insert(saturated, AgentSnapshot { limit: Some(1), running: 1 });
        agents.insert(open, AgentSnapshot { limit: None, running: 0 });

        let org = OrgSnapshot { limit: None, running: 0 };
        let accepted = plan_admissions(&org, &queue, &agents);
        prop_assert_eq!(accepted, vec![Uuid::from_u128(0xEE)]);
    }
}
