//! Recording transport double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use bcp_core::DispatchTransport;
use bcp_schemas::DispatchNotice;

/// Captures every dispatch notice. Can be told to fail delivery while
/// still recording the attempt; admissions must survive transport
/// failures, so tests flip `set_failing(true)` and assert the ledger is
/// unchanged.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<DispatchNotice>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notices recorded so far, in delivery order.
    pub fn notices(&self) -> Vec<DispatchNotice> {
        self.sent.lock().expect("transport mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().expect("transport mutex poisoned").len()
    }

    /// Poll until at least `n` notices were delivered. Pair with an
    /// outer `tokio::time::timeout` in tests.
    pub async fn wait_for(&self, n: usize) {
        while self.count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DispatchTransport for RecordingTransport {
    async fn notify_dispatch(&self, running_id: Uuid, agent_id: Uuid) -> anyhow::Result<()> {
        self.sent
            .lock()
            .expect("transport mutex poisoned")
            .push(DispatchNotice {
                running_id,
                agent_id,
            });

        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("fleet gateway unreachable (injected)");
        }
        Ok(())
    }
}
