//! `stowage-core`: control plane foundation building blocks.
//!
//! Identifiers, the domain error model and the clock abstraction. No
//! infrastructure concerns live here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AgentId, JobId, OrgId, QueueEntryId, ScheduleId};
