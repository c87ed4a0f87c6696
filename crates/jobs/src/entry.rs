//! Admission queue entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stowage_core::{AgentId, DomainError, DomainResult, JobId, OrgId, QueueEntryId, ScheduleId};

/// Admission status of a queue entry. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    /// Waiting for capacity.
    Queued,
    /// Admitted; counts against the org and agent ceilings until finished.
    Started,
    /// Withdrawn before admission.
    Canceled,
}

impl QueueEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEntryStatus::Queued => "queued",
            QueueEntryStatus::Started => "started",
            QueueEntryStatus::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for QueueEntryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to place work in the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub schedule_id: ScheduleId,
    pub priority: i32,
    pub job_id: Option<JobId>,
}

impl EnqueueRequest {
    pub fn new(org_id: OrgId, agent_id: AgentId, schedule_id: ScheduleId, priority: i32) -> Self {
        Self {
            org_id,
            agent_id,
            schedule_id,
            priority,
            job_id: None,
        }
    }

    /// Link the entry to the job record it admits.
    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// One unit of work waiting for (or holding) an execution slot.
///
/// Position and wait estimates are never stored here; they are derived from
/// the live queued set when asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub schedule_id: ScheduleId,
    pub job_id: Option<JobId>,
    pub priority: i32,
    pub status: QueueEntryStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the runner reports completion or failure of a started entry.
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Insertion sequence within the org; final ordering tie-breaker.
    #[serde(default)]
    pub(crate) seq: u64,
}

impl QueueEntry {
    pub(crate) fn new(request: EnqueueRequest, now: DateTime<Utc>, seq: u64) -> Self {
        Self {
            id: QueueEntryId::new(),
            org_id: request.org_id,
            agent_id: request.agent_id,
            schedule_id: request.schedule_id,
            job_id: request.job_id,
            priority: request.priority,
            status: QueueEntryStatus::Queued,
            queued_at: now,
            started_at: None,
            finished_at: None,
            canceled_at: None,
            seq,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == QueueEntryStatus::Queued
    }

    /// Started and still holding its slot.
    pub fn is_running(&self) -> bool {
        self.status == QueueEntryStatus::Started && self.finished_at.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_queued() {
            return Err(DomainError::conflict(format!(
                "entry {} cannot start from status {}",
                self.id, self.status
            )));
        }
        self.status = QueueEntryStatus::Started;
        self.started_at = Some(now);
        Ok(())
    }

    pub(crate) fn mark_canceled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_queued() {
            return Err(DomainError::conflict(format!(
                "entry {} cannot be canceled from status {}",
                self.id, self.status
            )));
        }
        self.status = QueueEntryStatus::Canceled;
        self.canceled_at = Some(now);
        Ok(())
    }

    pub(crate) fn mark_finished(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_running() {
            return Err(DomainError::conflict(format!(
                "entry {} is not running (status {}, finished: {})",
                self.id,
                self.status,
                self.is_finished()
            )));
        }
        self.finished_at = Some(now);
        Ok(())
    }

    /// Time between enqueue and admission, if admitted.
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at
            .map(|started| (started - self.queued_at).max(Duration::zero()))
    }

    /// Run time of a finished entry.
    pub fn run_duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some((finished - started).max(Duration::zero())),
            _ => None,
        }
    }
}
