//! Notifications emitted as jobs move through admission and execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stowage_core::{AgentId, JobId, QueueEntryId};
use stowage_jobs::JobKind;

use crate::envelope::EventEnvelope;

/// A job lifecycle transition worth telling collaborators about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingEvent {
    JobSubmitted {
        job_id: JobId,
        kind: JobKind,
        priority: i32,
        agent_id: Option<AgentId>,
        entry_id: Option<QueueEntryId>,
    },
    /// The job got an execution slot and is now running.
    JobAdmitted {
        job_id: JobId,
        entry_id: QueueEntryId,
        agent_id: AgentId,
    },
    JobCompleted {
        job_id: JobId,
        duration_secs: i64,
    },
    JobRetryScheduled {
        job_id: JobId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    JobDeadLettered {
        job_id: JobId,
        retry_count: u32,
        error: String,
    },
    JobCanceled {
        job_id: JobId,
    },
    /// Back to pending, either after backoff (`manual == false`) or by operator.
    JobRequeued {
        job_id: JobId,
        retry_count: u32,
        manual: bool,
    },
}

impl SchedulingEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            SchedulingEvent::JobSubmitted { job_id, .. }
            | SchedulingEvent::JobAdmitted { job_id, .. }
            | SchedulingEvent::JobCompleted { job_id, .. }
            | SchedulingEvent::JobRetryScheduled { job_id, .. }
            | SchedulingEvent::JobDeadLettered { job_id, .. }
            | SchedulingEvent::JobCanceled { job_id }
            | SchedulingEvent::JobRequeued { job_id, .. } => *job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulingEvent::JobSubmitted { .. } => "job_submitted",
            SchedulingEvent::JobAdmitted { .. } => "job_admitted",
            SchedulingEvent::JobCompleted { .. } => "job_completed",
            SchedulingEvent::JobRetryScheduled { .. } => "job_retry_scheduled",
            SchedulingEvent::JobDeadLettered { .. } => "job_dead_lettered",
            SchedulingEvent::JobCanceled { .. } => "job_canceled",
            SchedulingEvent::JobRequeued { .. } => "job_requeued",
        }
    }
}

pub type SchedulingEnvelope = EventEnvelope<SchedulingEvent>;
