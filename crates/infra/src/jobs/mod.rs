//! Backup job orchestration: storage, admission glue and retry sweeping.
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records (in-memory for tests/dev)
//! - `JobService`: submit / report / cancel / retry, publishing scheduling events
//! - `RetrySweeper`: background thread driving backoff re-admission

pub mod service;
pub mod store;
pub mod sweeper;

pub use service::{JobService, JobServiceError, Sweep, SweepReport};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use sweeper::{RetrySweeper, RetrySweeperConfig, RetrySweeperHandle, SweeperStats};
