//! Shared wire and bus types for the backup control plane.
//!
//! Everything here is `Serialize + Deserialize` and free of business logic.
//! Field names match the public HTTP contract; store-internal row types live
//! in `bcp-store` and are mapped into these views at the query layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One queued backup as surfaced by `GET /api/v1/backup-queue`.
///
/// `queue_position` is the 1-indexed rank of the entry within its
/// organization under canonical queue order (priority desc, queued_at asc,
/// id asc) at a single transactional instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntryView {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub agent_id: Uuid,
    pub agent_hostname: String,
    pub priority: i32,
    pub queue_position: i64,
    pub queued_at: DateTime<Utc>,
}

/// Per-organization queue summary.
///
/// `oldest_queued_at` and `queued_by_agent` are omitted from the JSON body
/// when the queue is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total_queued: i64,
    pub total_running: i64,
    /// Mean of `now - queued_at` across queued entries, in minutes.
    pub avg_wait_minutes: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_queued_at: Option<DateTime<Utc>>,
    /// Queued entry count keyed by target agent. BTreeMap for a stable
    /// serialization order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_by_agent: Option<BTreeMap<Uuid, i64>>,
}

/// Concurrency state for an organization or an agent.
///
/// `max_concurrent_backups = None` serializes as `null` and means
/// unlimited; `Some(0)` means paused (no new admissions, in-flight work
/// unaffected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyView {
    pub max_concurrent_backups: Option<i32>,
    pub running_count: i64,
    pub queued_count: i64,
}

/// Payload delivered to the fleet gateway for one successful admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchNotice {
    pub running_id: Uuid,
    pub agent_id: Uuid,
}

/// Queue state changes broadcast over the daemon event bus and surfaced as
/// SSE events. The scheduler emits `Admitted` strictly after the admitting
/// transaction committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        org_id: Uuid,
        entry_id: Uuid,
        agent_id: Uuid,
    },
    Admitted {
        org_id: Uuid,
        entry_id: Uuid,
        running_id: Uuid,
        agent_id: Uuid,
    },
    Completed {
        org_id: Uuid,
        running_id: Uuid,
    },
    Canceled {
        org_id: Uuid,
        entry_id: Uuid,
    },
    LimitChanged {
        org_id: Uuid,
        /// `None` when the organization limit changed, `Some` for an agent
        /// limit change.
        agent_id: Option<Uuid>,
    },
}

impl QueueEvent {
    /// SSE event name for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Admitted { .. } => "admitted",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Canceled { .. } => "canceled",
            QueueEvent::LimitChanged { .. } => "limit_changed",
        }
    }

    /// Organization the event belongs to.
    pub fn org_id(&self) -> Uuid {
        match self {
            QueueEvent::Enqueued { org_id, .. }
            | QueueEvent::Admitted { org_id, .. }
            | QueueEvent::Completed { org_id, .. }
            | QueueEvent::Canceled { org_id, .. }
            | QueueEvent::LimitChanged { org_id, .. } => *org_id,
        }
    }
}
