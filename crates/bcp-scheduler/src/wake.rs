//! Wake signaling between the control surface and the scheduler task.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Why an org was marked dirty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    Enqueued,
    Completed,
    LimitChanged,
    Tick,
    /// A pass lost an admission race (`LimitViolated`) and asked to be
    /// re-run immediately.
    Retry,
}

/// One wake signal: re-evaluate admissions for `org_id`.
#[derive(Clone, Copy, Debug)]
pub struct Wake {
    pub org_id: Uuid,
    pub reason: WakeReason,
}

/// Cloneable sender half handed to HTTP handlers and to the scheduler's
/// own retry path. Sending never blocks and never fails the caller: a
/// lagged or closed channel is the tick safety net's problem.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: broadcast::Sender<Wake>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: broadcast::Sender<Wake>) -> Self {
        Self { tx }
    }

    pub fn wake(&self, org_id: Uuid, reason: WakeReason) {
        let _ = self.tx.send(Wake { org_id, reason });
    }

    pub fn notify_enqueued(&self, org_id: Uuid) {
        self.wake(org_id, WakeReason::Enqueued);
    }

    pub fn notify_completed(&self, org_id: Uuid) {
        self.wake(org_id, WakeReason::Completed);
    }

    pub fn notify_limit_changed(&self, org_id: Uuid) {
        self.wake(org_id, WakeReason::LimitChanged);
    }
}
