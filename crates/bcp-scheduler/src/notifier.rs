//! HTTP dispatch notifier for the fleet gateway.

use async_trait::async_trait;
use uuid::Uuid;

use bcp_core::DispatchTransport;
use bcp_schemas::DispatchNotice;

/// Delivers dispatch notices to the fleet gateway with one POST per
/// admission. The gateway owns fan-out to the actual agent connection;
/// this side neither retries nor buffers; redelivery is the gateway's
/// concern.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    http: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn dispatch_url(&self, agent_id: Uuid) -> String {
        format!(
            "{}/agents/{agent_id}/dispatch",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl DispatchTransport for HttpNotifier {
    async fn notify_dispatch(&self, running_id: Uuid, agent_id: Uuid) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.dispatch_url(agent_id))
            .json(&DispatchNotice {
                running_id,
                agent_id,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("fleet gateway returned {status} for agent {agent_id}");
        }
        Ok(())
    }
}

/// Transport stand-in for deployments without a fleet gateway (drills,
/// local development): logs every notice and succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl DispatchTransport for LogNotifier {
    async fn notify_dispatch(&self, running_id: Uuid, agent_id: Uuid) -> anyhow::Result<()> {
        tracing::info!(%running_id, %agent_id, "dispatch (delivery disabled)");
        Ok(())
    }
}
