//! `stowage-jobs`: backup job lifecycle and concurrency admission.
//!
//! - `record`: job state machine (pending → running → completed / failed / dead letter)
//! - `retry`: exponential backoff policy
//! - `entry` / `ordering`: admission queue entries and their total order
//! - `limits`: org/agent ceilings supplied by the registry
//! - `admission`: the admission controller
//! - `status`: derived positions, estimates and summaries

pub mod admission;
pub mod entry;
pub mod limits;
pub mod ordering;
pub mod record;
pub mod retry;
pub mod status;

pub use admission::{AdmissionConfig, AdmissionController};
pub use entry::{EnqueueRequest, QueueEntry, QueueEntryStatus};
pub use limits::{ConcurrencyLimits, InMemoryLimits, LimitsProvider};
pub use record::{CANCELED_MESSAGE, JobKind, JobRecord, JobStatus};
pub use retry::{RetryDecision, RetryPolicy};
pub use status::{BindingScope, ConcurrencyStatus, QueuePosition, QueueSummary, ScopeCounters};
