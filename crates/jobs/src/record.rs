//! Job record: lifecycle of one backup, restore or verification run.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stowage_core::{AgentId, DomainError, DomainResult, JobId, OrgId, ScheduleId};

use crate::retry::{RetryDecision, RetryPolicy};

/// Error message recorded when a pending job is canceled.
pub const CANCELED_MESSAGE: &str = "job canceled before execution";

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
    Verification,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
            JobKind::Verification => "verification",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution status.
///
/// Transition table:
///
/// ```text
/// Pending  -> Running | DeadLetter (cancel)
/// Running  -> Completed | Failed | DeadLetter (retries exhausted)
/// Failed   -> Pending (backoff elapsed, or manual retry)
/// DeadLetter -> Pending (manual retry only)
/// Completed  -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for admission.
    Pending,
    /// Admitted and being executed by an agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with retries remaining; waiting for backoff.
    Failed,
    /// Retries exhausted or canceled; only a manual retry revives it.
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, DeadLetter)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, DeadLetter)
                | (Failed, Pending)
                | (DeadLetter, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of backup/restore/verification work.
///
/// Invariants:
/// - `retry_count <= max_retries` unless the job is dead-lettered.
/// - `next_retry_at` is set iff the status is `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub org_id: OrgId,
    pub agent_id: Option<AgentId>,
    pub schedule_id: Option<ScheduleId>,
    pub kind: JobKind,
    /// Higher is more urgent.
    pub priority: i32,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new pending job.
    pub fn new(org_id: OrgId, kind: JobKind, priority: i32, payload: serde_json::Value) -> Self {
        Self::new_at(org_id, kind, priority, payload, Utc::now())
    }

    pub fn new_at(
        org_id: OrgId,
        kind: JobKind,
        priority: i32,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            org_id,
            agent_id: None,
            schedule_id: None,
            kind,
            priority,
            status: JobStatus::Pending,
            payload,
            result: None,
            retry_count: 0,
            max_retries: RetryPolicy::default().max_retries,
            next_retry_at: None,
            error_message: None,
            error_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    fn ensure_transition(&self, next: JobStatus, op: &str) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "cannot {op} job {} in status {}",
                self.id, self.status
            )))
        }
    }

    /// Pending -> Running.
    pub fn start(&mut self) -> DomainResult<()> {
        self.start_at(Utc::now())
    }

    pub fn start_at(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Running, "start")?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        Ok(())
    }

    /// Running -> Completed.
    pub fn complete(&mut self, result: serde_json::Value) -> DomainResult<()> {
        self.complete_at(result, Utc::now())
    }

    pub fn complete_at(&mut self, result: serde_json::Value, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Completed, "complete")?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Running -> Failed (retryable) or DeadLetter (exhausted).
    pub fn fail(&mut self, message: impl Into<String>) -> DomainResult<RetryDecision> {
        self.fail_at(message, &RetryPolicy::default(), Utc::now())
    }

    pub fn fail_at(
        &mut self,
        message: impl Into<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<RetryDecision> {
        // Running may go to either Failed or DeadLetter; both are checked below.
        self.ensure_transition(JobStatus::Failed, "fail")?;

        self.retry_count += 1;
        self.error_message = Some(message.into());
        self.error_at = Some(now);

        let decision = policy.decide(self.retry_count, self.max_retries, now);
        match decision {
            RetryDecision::RetryAt(at) => {
                self.status = JobStatus::Failed;
                self.next_retry_at = Some(at);
            }
            RetryDecision::Exhausted => {
                self.status = JobStatus::DeadLetter;
                self.next_retry_at = None;
                self.completed_at = Some(now);
            }
        }
        Ok(decision)
    }

    /// Pending -> DeadLetter. Returns `false` (and changes nothing) from any
    /// other status.
    pub fn cancel(&mut self) -> bool {
        self.cancel_at(Utc::now())
    }

    pub fn cancel_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::DeadLetter;
        self.error_message = Some(CANCELED_MESSAGE.to_string());
        self.error_at = Some(now);
        self.completed_at = Some(now);
        true
    }

    /// Manual override: Failed/DeadLetter -> Pending with a fresh retry budget.
    pub fn retry(&mut self) -> DomainResult<()> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::DeadLetter) {
            return Err(DomainError::validation(format!(
                "cannot retry job {} in status {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.error_message = None;
        self.error_at = None;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        Ok(())
    }

    /// Automatic re-admission after backoff: Failed -> Pending, keeping the
    /// retry count and the last error for inspection.
    pub fn requeue_at(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.ready_for_retry(now) {
            return Err(DomainError::validation(format!(
                "job {} is not ready for retry (status {})",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Pending;
        self.next_retry_at = None;
        self.started_at = None;
        Ok(())
    }

    /// Failed and the backoff (if any) has elapsed at `now`.
    pub fn ready_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed && self.next_retry_at.is_none_or(|at| now >= at)
    }

    /// Time spent running: `(completed_at or now) - started_at`, zero if the
    /// job never started.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        match self.started_at {
            Some(started) => {
                let end = self.completed_at.unwrap_or(now);
                (end - started).max(Duration::zero())
            }
            None => Duration::zero(),
        }
    }

    /// Time spent waiting for admission.
    pub fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        let end = self.started_at.unwrap_or(now);
        (end - self.created_at).max(Duration::zero())
    }
}
