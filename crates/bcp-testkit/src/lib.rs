//! bcp-testkit
//!
//! Deterministic in-process doubles for the orchestration core:
//!
//! - [`MemStore`]: an in-memory `QueueStore` honoring the same
//!   linearization contract as the Postgres store (atomic mutations,
//!   in-"transaction" limit re-check, single pass-lock holder per org)
//!   with a deterministic monotonic clock instead of wall time.
//! - [`RecordingTransport`]: captures dispatch notices and can be told
//!   to fail delivery, for proving that transport failures never roll
//!   back admissions.
//!
//! No network I/O, no wall-clock dependence, no randomness beyond the
//! ids the caller supplies.

mod mem_store;
mod transport;

pub use mem_store::MemStore;
pub use transport::RecordingTransport;
