//! One-way dispatch notification to the fleet gateway.

use async_trait::async_trait;
use uuid::Uuid;

/// Notifies the transport collaborator that a job was admitted.
///
/// Called exactly once per successful admission, strictly after the
/// admitting transaction committed; an agent must never see a job the
/// store has not recorded. Delivery failure does not roll back the
/// admission; redelivery is a transport concern and the scheduler only
/// logs the error.
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    async fn notify_dispatch(&self, running_id: Uuid, agent_id: Uuid) -> anyhow::Result<()>;
}
