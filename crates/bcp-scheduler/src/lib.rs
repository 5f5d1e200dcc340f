//! bcp-scheduler
//!
//! The single source of dispatch decisions. One scheduler task per
//! process drains a dirty-org set fed by wake events (enqueue,
//! completion, limit change) and a periodic tick safety net; each org
//! pass runs under the store's advisory pass lock, plans admissions with
//! the pure planner, admits through `admit_atomic`, and notifies the
//! transport strictly after commit.
//!
//! Multiple daemon replicas coexist: a replica that loses the pass lock
//! for an org simply skips that pass.

mod notifier;
mod runner;
mod wake;

pub use notifier::{HttpNotifier, LogNotifier};
pub use runner::{PassReport, Scheduler, SchedulerConfig};
pub use wake::{SchedulerHandle, Wake, WakeReason};
