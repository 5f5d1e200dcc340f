//! bcp-core
//!
//! Core seams and engines of the backup orchestration plane:
//!
//! - the typed error taxonomy every layer speaks (`CoreError`)
//! - the narrow transactional store contract (`QueueStore`)
//! - the one-way dispatch notifier contract (`DispatchTransport`)
//! - canonical queue ordering and the pure, deterministic admission
//!   planner (`plan_admissions`)
//! - the limit resolver composing effective concurrency views
//!
//! The planner is pure logic: no I/O, no wall-clock, no randomness. The
//! authoritative limit re-check lives in the store's `admit_atomic`; the
//! planner only decides which entries are worth attempting in a pass.

mod error;

pub mod admission;
pub mod limits;
pub mod store;
pub mod transport;

pub use admission::{canonical_cmp, plan_admissions, AgentSnapshot, OrgSnapshot};
pub use error::{ensure_live, CoreError};
pub use limits::{validate_limit, AgentConcurrency, LimitResolver, OrgConcurrency};
pub use store::{
    AdmittedJob, CancelOutcome, CompleteOutcome, NewQueueEntry, OrgPassLock, QueueStore, QueuedJob,
};
pub use transport::DispatchTransport;
