//! Canonical queue ordering and the admission planner.
//!
//! Pure deterministic logic, no I/O and no wall-clock: both the Postgres
//! store (via SQL `ORDER BY`) and the in-memory store (via
//! `canonical_cmp`) produce the same total order, and for a given
//! snapshot `plan_admissions` returns the same list on every thread.

use std::cmp::Ordering;
use std::collections::HashMap;

use uuid::Uuid;

use crate::store::QueuedJob;

/// Org-level input snapshot for one planning pass.
#[derive(Debug, Clone, Copy)]
pub struct OrgSnapshot {
    /// `None` = unlimited, `Some(0)` = paused.
    pub limit: Option<i32>,
    pub running: i64,
}

/// Agent-level input snapshot for one planning pass.
#[derive(Debug, Clone, Copy)]
pub struct AgentSnapshot {
    pub limit: Option<i32>,
    pub running: i64,
}

/// Canonical queue order within an organization:
/// 1. strictly higher priority first;
/// 2. on tie, earlier `queued_at` first;
/// 3. on tie, lexicographically smaller entry id first.
///
/// A total order, so admission is deterministic for a given snapshot.
pub fn canonical_cmp(a: &QueuedJob, b: &QueuedJob) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.queued_at.cmp(&b.queued_at))
        .then_with(|| a.entry_id.cmp(&b.entry_id))
}

/// Select the queued entries that may transition to running without
/// violating the org or any agent limit.
///
/// `queue` must already be in canonical order (the stores guarantee it).
/// Walks the queue maintaining a provisional per-agent counter seeded
/// from current running counts. An entry whose agent is saturated is
/// skipped (a blocked agent must not block the org's progress on other
/// agents) and the walk stops once the org cap is exhausted.
///
/// The returned ids are in selection order. The result is a plan, not a
/// grant: `admit_atomic` re-checks every limit inside its transaction.
pub fn plan_admissions(
    org: &OrgSnapshot,
    queue: &[QueuedJob],
    agents: &HashMap<Uuid, AgentSnapshot>,
) -> Vec<Uuid> {
    let mut org_cap = match org.limit {
        Some(limit) => {
            let cap = i64::from(limit) - org.running;
            if cap <= 0 {
                return Vec::new();
            }
            Some(cap)
        }
        None => None,
    };

    let mut planned: HashMap<Uuid, i64> = HashMap::new();
    let mut accepted = Vec::new();

    for job in queue {
        let agent = agents.get(&job.agent_id);
        let in_flight = planned.entry(job.agent_id).or_insert_with(|| {
            agent.map(|a| a.running).unwrap_or(0)
        });

        if let Some(limit) = agent.and_then(|a| a.limit) {
            if *in_flight + 1 > i64::from(limit) {
                // Saturated agent: skip, keep walking.
                continue;
            }
        }

        *in_flight += 1;
        accepted.push(job.entry_id);

        if let Some(cap) = org_cap.as_mut() {
            *cap -= 1;
            if *cap == 0 {
                break;
            }
        }
    }

    accepted
}
