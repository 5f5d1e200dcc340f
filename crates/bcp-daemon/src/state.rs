//! Shared runtime state for bcp-daemon.
//!
//! One `AppState` per process, handed to every handler behind an `Arc`.
//! Nothing in here runs its own tasks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use bcp_authz::ActorContext;
use bcp_core::QueueStore;
use bcp_schemas::QueueEvent;
use bcp_scheduler::SchedulerHandle;

/// Build identity reported by the health endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Everything a handler can reach, shared behind one `Arc`.
pub struct AppState {
    /// The transactional store behind every core operation.
    pub store: Arc<dyn QueueStore>,
    /// Wake sender into the scheduler loop.
    pub scheduler: SchedulerHandle,
    /// Queue event bus, surfaced over SSE. The scheduler publishes
    /// `Admitted`; handlers publish the rest.
    pub events: broadcast::Sender<QueueEvent>,
    /// Bearer token → actor. The session collaborator is external; the
    /// daemon only resolves tokens it was configured with.
    pub sessions: HashMap<String, ActorContext>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        store: Arc<dyn QueueStore>,
        scheduler: SchedulerHandle,
        events: broadcast::Sender<QueueEvent>,
        tokens: &[bcp_config::StaticToken],
    ) -> Self {
        let sessions = tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    ActorContext {
                        actor_id: t.actor_id,
                        org_id: t.org_id,
                        role: t.role,
                        platform_admin: t.platform_admin,
                    },
                )
            })
            .collect();

        Self {
            store,
            scheduler,
            events,
            sessions,
            build: BuildInfo {
                service: "bcp-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    /// Publish a queue event; a bus without subscribers is fine.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}
