//! Job service: glues the job store, the admission controller and the event bus.
//!
//! The service owns the mapping between the two lifecycles: a job is
//! `Running` exactly while its queue entry holds a slot. Every admission,
//! however it happened (submit, completion, sweep), goes through
//! [`JobService::handle_admitted`] so the job record follows.
//!
//! Job transitions are written with [`JobStore::update_if`] against the
//! status they were loaded in. When two callers race on one job, the loser
//! gets [`JobStoreError::StatusConflict`] and publishes nothing.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use stowage_core::{AgentId, Clock, DomainError, JobId, OrgId, ScheduleId, SystemClock};
use stowage_events::{EventBus, SchedulingEnvelope, SchedulingEvent};
use stowage_jobs::{
    AdmissionController, ConcurrencyStatus, EnqueueRequest, JobKind, JobRecord, JobStatus,
    LimitsProvider, QueueEntry, QueueSummary, RetryDecision, RetryPolicy,
};

use super::store::{JobStats, JobStore, JobStoreError};
use crate::config::SchedulerConfig;

/// Job service error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Failed jobs moved back to pending after their backoff elapsed.
    pub requeued: usize,
    /// Jobs that got an execution slot during the sweep.
    pub admitted: usize,
}

/// Something that can run a retry sweep; implemented by [`JobService`].
pub trait Sweep: Send + Sync {
    fn sweep(&self) -> Result<SweepReport, JobServiceError>;
}

pub struct JobService<S, B, L, C = SystemClock> {
    store: S,
    bus: B,
    admission: AdmissionController<L, C>,
    clock: C,
    retry_policy: RetryPolicy,
}

impl<S, B, L> JobService<S, B, L>
where
    S: JobStore,
    B: EventBus<SchedulingEnvelope>,
    L: LimitsProvider,
{
    pub fn new(store: S, bus: B, limits: L, config: &SchedulerConfig) -> Self {
        Self::with_clock(store, bus, limits, SystemClock, config)
    }
}

impl<S, B, L, C> JobService<S, B, L, C>
where
    S: JobStore,
    B: EventBus<SchedulingEnvelope>,
    L: LimitsProvider,
    C: Clock + Clone,
{
    pub fn with_clock(store: S, bus: B, limits: L, clock: C, config: &SchedulerConfig) -> Self {
        let admission = AdmissionController::with_clock(limits, clock.clone()).with_config(config.admission);
        Self {
            store,
            bus,
            admission,
            clock,
            retry_policy: config.retry,
        }
    }

    pub fn admission(&self) -> &AdmissionController<L, C> {
        &self.admission
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a pending job and queue it for admission.
    ///
    /// Returns the job as stored after admission: `Running` if a slot was free.
    pub fn submit(
        &self,
        org_id: OrgId,
        agent_id: AgentId,
        schedule_id: ScheduleId,
        kind: JobKind,
        priority: i32,
        payload: serde_json::Value,
    ) -> Result<JobRecord, JobServiceError> {
        let now = self.clock.now();
        let job = JobRecord::new_at(org_id, kind, priority, payload, now)
            .with_agent(agent_id)
            .with_schedule(schedule_id)
            .with_max_retries(self.retry_policy.max_retries);
        let job_id = self.store.insert(job)?;

        let request = EnqueueRequest::new(org_id, agent_id, schedule_id, priority).for_job(job_id);
        let (entry, admitted) = self.admission.enqueue_and_admit(request)?;
        info!(
            org_id = %org_id,
            job_id = %job_id,
            kind = %kind,
            priority,
            entry_id = %entry.id,
            "job submitted"
        );
        self.publish(
            org_id,
            now,
            SchedulingEvent::JobSubmitted {
                job_id,
                kind,
                priority,
                agent_id: Some(agent_id),
                entry_id: Some(entry.id),
            },
        );

        self.handle_admitted(admitted);
        self.load(org_id, job_id)
    }

    /// Record successful execution and release the job's slot.
    pub fn report_success(
        &self,
        org_id: OrgId,
        job_id: JobId,
        result: serde_json::Value,
    ) -> Result<JobRecord, JobServiceError> {
        let now = self.clock.now();
        let mut job = self.load(org_id, job_id)?;
        job.complete_at(result, now)?;
        self.store.update_if(&job, JobStatus::Running)?;
        info!(org_id = %org_id, job_id = %job_id, "job completed");

        self.publish(
            org_id,
            now,
            SchedulingEvent::JobCompleted {
                job_id,
                duration_secs: job.duration(now).num_seconds(),
            },
        );
        self.release_slot(org_id, job_id, true)?;
        Ok(job)
    }

    /// Record failed execution: schedule a retry or dead-letter the job.
    pub fn report_failure(
        &self,
        org_id: OrgId,
        job_id: JobId,
        message: impl Into<String>,
    ) -> Result<JobRecord, JobServiceError> {
        let now = self.clock.now();
        let mut job = self.load(org_id, job_id)?;
        let message = message.into();
        let decision = job.fail_at(message.clone(), &self.retry_policy, now)?;
        self.store.update_if(&job, JobStatus::Running)?;

        let event = match decision {
            RetryDecision::RetryAt(next_retry_at) => {
                info!(
                    org_id = %org_id,
                    job_id = %job_id,
                    retry_count = job.retry_count,
                    next_retry_at = %next_retry_at,
                    error = %message,
                    "job failed, retry scheduled"
                );
                SchedulingEvent::JobRetryScheduled {
                    job_id,
                    retry_count: job.retry_count,
                    next_retry_at,
                    error: message,
                }
            }
            RetryDecision::Exhausted => {
                warn!(
                    org_id = %org_id,
                    job_id = %job_id,
                    retry_count = job.retry_count,
                    error = %message,
                    "job dead-lettered"
                );
                SchedulingEvent::JobDeadLettered {
                    job_id,
                    retry_count: job.retry_count,
                    error: message,
                }
            }
        };
        self.publish(org_id, now, event);
        self.release_slot(org_id, job_id, false)?;
        Ok(job)
    }

    /// Cancel a job that has not started yet.
    ///
    /// Returns `false` (and changes nothing) once the job was admitted or is
    /// otherwise not pending.
    pub fn cancel(&self, org_id: OrgId, job_id: JobId) -> Result<bool, JobServiceError> {
        let now = self.clock.now();
        let mut job = self.load(org_id, job_id)?;
        if job.status != JobStatus::Pending {
            return Ok(false);
        }

        if let Some(entry) = self.admission.entry_for_job(org_id, job_id)? {
            match self.admission.cancel(entry.id) {
                Ok(_) => {}
                // Admitted concurrently; the job is about to run.
                Err(DomainError::Conflict(_)) => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }

        if !job.cancel_at(now) {
            return Ok(false);
        }
        match self.store.update_if(&job, JobStatus::Pending) {
            Ok(()) => {}
            Err(JobStoreError::StatusConflict { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        info!(org_id = %org_id, job_id = %job_id, "job canceled");
        self.publish(org_id, now, SchedulingEvent::JobCanceled { job_id });
        Ok(true)
    }

    /// Operator override: revive a failed or dead-lettered job with a fresh
    /// retry budget, bypassing backoff.
    pub fn retry(&self, org_id: OrgId, job_id: JobId) -> Result<JobRecord, JobServiceError> {
        let now = self.clock.now();
        let mut job = self.load(org_id, job_id)?;
        let request = admission_request(&job)?;
        let previous = job.status;
        job.retry()?;
        self.store.update_if(&job, previous)?;
        info!(org_id = %org_id, job_id = %job_id, "job manually retried");
        self.publish(
            org_id,
            now,
            SchedulingEvent::JobRequeued {
                job_id,
                retry_count: job.retry_count,
                manual: true,
            },
        );

        self.enqueue(request)?;
        self.load(org_id, job_id)
    }

    /// Requeue every failed job whose backoff elapsed, then offer free slots
    /// to everything still queued.
    ///
    /// A job that cannot be requeued is logged and skipped; it stays `Failed`
    /// and is picked up again by the next sweep.
    pub fn sweep(&self) -> Result<SweepReport, JobServiceError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for mut job in self.store.ready_for_retry(now, usize::MAX)? {
            let requeued = admission_request(&job).and_then(|request| {
                job.requeue_at(now)?;
                Ok(request)
            });
            let request = match requeued {
                Ok(request) => request,
                Err(err) => {
                    warn!(org_id = %job.org_id, job_id = %job.id, error = %err, "job not requeued");
                    continue;
                }
            };
            match self.store.update_if(&job, JobStatus::Failed) {
                Ok(()) => {}
                Err(JobStoreError::StatusConflict { actual, .. }) => {
                    debug!(org_id = %job.org_id, job_id = %job.id, status = %actual, "job requeued elsewhere");
                    continue;
                }
                Err(err) => {
                    warn!(org_id = %job.org_id, job_id = %job.id, error = %err, "job not requeued");
                    continue;
                }
            }
            debug!(
                org_id = %job.org_id,
                job_id = %job.id,
                retry_count = job.retry_count,
                "job requeued after backoff"
            );
            self.publish(
                job.org_id,
                now,
                SchedulingEvent::JobRequeued {
                    job_id: job.id,
                    retry_count: job.retry_count,
                    manual: false,
                },
            );
            report.requeued += 1;
            match self.enqueue(request) {
                Ok(admitted) => report.admitted += admitted,
                Err(err) => {
                    warn!(org_id = %job.org_id, job_id = %job.id, error = %err, "requeued job not queued for admission");
                }
            }
        }

        report.admitted += self.handle_admitted(self.admission.admit_sweep()?);
        Ok(report)
    }

    pub fn get(&self, org_id: OrgId, job_id: JobId) -> Result<Option<JobRecord>, JobServiceError> {
        Ok(self.store.get(org_id, job_id)?)
    }

    pub fn stats(&self, org_id: OrgId) -> Result<JobStats, JobServiceError> {
        Ok(self.store.stats(org_id)?)
    }

    pub fn dead_letters(&self, org_id: OrgId, limit: usize) -> Result<Vec<JobRecord>, JobServiceError> {
        Ok(self.store.list_dead_letters(org_id, limit)?)
    }

    pub fn concurrency_status(
        &self,
        org_id: OrgId,
        agent_id: AgentId,
    ) -> Result<ConcurrencyStatus, JobServiceError> {
        Ok(self.admission.status(org_id, agent_id)?)
    }

    pub fn queue_summary(&self, org_id: OrgId) -> Result<QueueSummary, JobServiceError> {
        Ok(self.admission.summary(org_id)?)
    }

    fn load(&self, org_id: OrgId, job_id: JobId) -> Result<JobRecord, JobServiceError> {
        self.store
            .get(org_id, job_id)?
            .ok_or(JobServiceError::Store(JobStoreError::NotFound(job_id)))
    }

    /// Queue a pending job; returns how many jobs were admitted as a result.
    fn enqueue(&self, request: EnqueueRequest) -> Result<usize, JobServiceError> {
        let (_, admitted) = self.admission.enqueue_and_admit(request)?;
        Ok(self.handle_admitted(admitted))
    }

    /// Free the slot held by a finished job and start whatever it unblocks.
    fn release_slot(&self, org_id: OrgId, job_id: JobId, succeeded: bool) -> Result<usize, JobServiceError> {
        let Some(entry) = self.admission.entry_for_job(org_id, job_id)? else {
            warn!(org_id = %org_id, job_id = %job_id, "finished job held no queue entry");
            return Ok(0);
        };
        let admitted = if succeeded {
            self.admission.complete(entry.id)?
        } else {
            self.admission.fail(entry.id)?
        };
        Ok(self.handle_admitted(admitted))
    }

    /// Start the job behind each newly admitted entry.
    ///
    /// An entry whose job cannot be started gives its slot back, which may
    /// admit further entries; those are processed in the same pass. One bad
    /// entry never strands the slots of the others.
    fn handle_admitted(&self, admitted: Vec<QueueEntry>) -> usize {
        let mut pending = admitted;
        let mut started = 0;

        while let Some(entry) = pending.pop() {
            let Some(job_id) = entry.job_id else {
                continue;
            };
            match self.start_job(&entry, job_id) {
                Ok(()) => started += 1,
                Err(err) => {
                    warn!(
                        org_id = %entry.org_id,
                        job_id = %job_id,
                        entry_id = %entry.id,
                        error = %err,
                        "admitted entry's job cannot start, releasing slot"
                    );
                    match self.admission.release(entry.id) {
                        Ok(next) => pending.extend(next),
                        Err(err) => error!(
                            org_id = %entry.org_id,
                            entry_id = %entry.id,
                            error = %err,
                            "failed to release admitted entry"
                        ),
                    }
                }
            }
        }
        started
    }

    fn start_job(&self, entry: &QueueEntry, job_id: JobId) -> Result<(), JobServiceError> {
        let now = self.clock.now();
        let mut job = self.load(entry.org_id, job_id)?;
        job.start_at(now)?;
        self.store.update_if(&job, JobStatus::Pending)?;
        info!(
            org_id = %entry.org_id,
            agent_id = %entry.agent_id,
            job_id = %job_id,
            entry_id = %entry.id,
            "job admitted"
        );
        self.publish(
            entry.org_id,
            now,
            SchedulingEvent::JobAdmitted {
                job_id,
                entry_id: entry.id,
                agent_id: entry.agent_id,
            },
        );
        Ok(())
    }

    fn publish(&self, org_id: OrgId, occurred_at: DateTime<Utc>, event: SchedulingEvent) {
        let name = event.name();
        if let Err(err) = self.bus.publish(SchedulingEnvelope::new(org_id, occurred_at, event)) {
            warn!(org_id = %org_id, event = name, error = %err, "failed to publish scheduling event");
        }
    }
}

/// Admission request for a job that is about to be (re)queued.
fn admission_request(job: &JobRecord) -> Result<EnqueueRequest, DomainError> {
    let agent_id = job
        .agent_id
        .ok_or_else(|| DomainError::validation(format!("job {} has no target agent", job.id)))?;
    let schedule_id = job
        .schedule_id
        .ok_or_else(|| DomainError::validation(format!("job {} has no schedule", job.id)))?;
    Ok(EnqueueRequest::new(job.org_id, agent_id, schedule_id, job.priority).for_job(job.id))
}

impl<S, B, L, C> Sweep for JobService<S, B, L, C>
where
    S: JobStore,
    B: EventBus<SchedulingEnvelope>,
    L: LimitsProvider,
    C: Clock + Clone,
{
    fn sweep(&self) -> Result<SweepReport, JobServiceError> {
        JobService::sweep(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone};
    use stowage_core::ManualClock;
    use stowage_events::{InMemoryEventBus, Subscription};
    use stowage_jobs::{CANCELED_MESSAGE, InMemoryLimits};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    /// In-memory store with injectable faults.
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryJobStore,
        /// Reads and writes of this job fail.
        broken: Mutex<Option<JobId>>,
        /// Pause after each read, widening read-modify-write windows.
        read_delay: Mutex<Option<StdDuration>>,
    }

    impl FaultyStore {
        fn break_job(&self, job_id: Option<JobId>) {
            *self.broken.lock().unwrap() = job_id;
        }

        fn slow_reads(&self, delay: StdDuration) {
            *self.read_delay.lock().unwrap() = Some(delay);
        }

        fn check(&self, job_id: JobId) -> Result<(), JobStoreError> {
            if *self.broken.lock().unwrap() == Some(job_id) {
                return Err(JobStoreError::Storage("disk unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl JobStore for FaultyStore {
        fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
            self.inner.insert(job)
        }

        fn get(&self, org_id: OrgId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.check(job_id)?;
            let job = self.inner.get(org_id, job_id)?;
            let delay = *self.read_delay.lock().unwrap();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            Ok(job)
        }

        fn update(&self, job: &JobRecord) -> Result<(), JobStoreError> {
            self.check(job.id)?;
            self.inner.update(job)
        }

        fn update_if(&self, job: &JobRecord, expected: JobStatus) -> Result<(), JobStoreError> {
            self.check(job.id)?;
            self.inner.update_if(job, expected)
        }

        fn list_by_status(
            &self,
            org_id: OrgId,
            status: Option<JobStatus>,
            limit: usize,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list_by_status(org_id, status, limit)
        }

        fn ready_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.ready_for_retry(now, limit)
        }

        fn list_dead_letters(&self, org_id: OrgId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list_dead_letters(org_id, limit)
        }

        fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
            self.inner.stats(org_id)
        }
    }

    type Service = JobService<
        Arc<FaultyStore>,
        Arc<InMemoryEventBus<SchedulingEnvelope>>,
        Arc<InMemoryLimits>,
        Arc<ManualClock>,
    >;

    struct Harness {
        service: Service,
        store: Arc<FaultyStore>,
        limits: Arc<InMemoryLimits>,
        clock: Arc<ManualClock>,
        events: Subscription<SchedulingEnvelope>,
        org: OrgId,
        agent: AgentId,
    }

    impl Harness {
        fn new() -> Self {
            let limits = InMemoryLimits::arc();
            let clock = ManualClock::arc(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
            let bus = Arc::new(InMemoryEventBus::new());
            let events = bus.subscribe();
            let store = Arc::new(FaultyStore::default());
            let service = JobService::with_clock(
                Arc::clone(&store),
                bus,
                Arc::clone(&limits),
                Arc::clone(&clock),
                &SchedulerConfig::default(),
            );
            Self {
                service,
                store,
                limits,
                clock,
                events,
                org: OrgId::new(),
                agent: AgentId::new(),
            }
        }

        fn submit(&self, priority: i32) -> JobRecord {
            self.service
                .submit(
                    self.org,
                    self.agent,
                    ScheduleId::new(),
                    JobKind::Backup,
                    priority,
                    serde_json::json!({ "paths": ["/var/lib"] }),
                )
                .unwrap()
        }

        fn stored(&self, job_id: JobId) -> JobRecord {
            self.store.inner.get(self.org, job_id).unwrap().unwrap()
        }

        fn event_names(&self) -> Vec<&'static str> {
            self.events.drain().iter().map(|e| e.payload().name()).collect()
        }
    }

    #[test]
    fn submit_with_free_capacity_runs_immediately() {
        let h = Harness::new();
        let job = h.submit(0);

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.agent_id, Some(h.agent));
        assert_eq!(h.event_names(), vec!["job_submitted", "job_admitted"]);
        assert_eq!(h.service.stats(h.org).unwrap().running, 1);
    }

    #[test]
    fn completion_admits_next_job() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(1));

        let first = h.submit(0);
        let second = h.submit(5);
        assert_eq!(second.status, JobStatus::Pending);

        h.clock.advance(Duration::minutes(3));
        let done = h
            .service
            .report_success(h.org, first.id, serde_json::json!({ "bytes": 1024 }))
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({ "bytes": 1024 })));

        let second = h.service.get(h.org, second.id).unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Running);

        let events: Vec<SchedulingEvent> = h.events.drain().into_iter().map(|e| e.into_payload()).collect();
        assert!(events.contains(&SchedulingEvent::JobCompleted {
            job_id: first.id,
            duration_secs: 180
        }));
    }

    #[test]
    fn failure_schedules_retry_and_sweep_requeues_after_backoff() {
        let h = Harness::new();
        let job = h.submit(0);

        let failed = h.service.report_failure(h.org, job.id, "network unreachable").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);

        h.clock.advance(Duration::seconds(29));
        assert_eq!(h.service.sweep().unwrap(), SweepReport::default());

        h.clock.advance(Duration::seconds(1));
        let report = h.service.sweep().unwrap();
        assert_eq!(report, SweepReport { requeued: 1, admitted: 1 });

        let job = h.service.get(h.org, job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn exhausted_retries_dead_letter_the_job() {
        let h = Harness::new();
        let job = h.submit(0);

        for attempt in 1..=3 {
            let failed = h.service.report_failure(h.org, job.id, "disk full").unwrap();
            if attempt < 3 {
                assert_eq!(failed.status, JobStatus::Failed);
                h.clock.advance(Duration::hours(1));
                h.service.sweep().unwrap();
            } else {
                assert_eq!(failed.status, JobStatus::DeadLetter);
                assert_eq!(failed.error_message.as_deref(), Some("disk full"));
                assert!(failed.completed_at.is_some());
            }
        }

        let dead = h.service.dead_letters(h.org, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert!(h.event_names().contains(&"job_dead_lettered"));

        // Slot was released.
        assert_eq!(h.service.concurrency_status(h.org, h.agent).unwrap().org.running, 0);
    }

    #[test]
    fn manual_retry_revives_dead_letter() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(0));
        let job = h.submit(0);
        assert!(h.service.cancel(h.org, job.id).unwrap());

        h.limits.set_org_limit(h.org, None);
        let revived = h.service.retry(h.org, job.id).unwrap();
        assert_eq!(revived.status, JobStatus::Running);
        assert_eq!(revived.retry_count, 0);
        assert_eq!(revived.error_message, None);
        assert_eq!(revived.completed_at, None);
        assert!(h.event_names().ends_with(&["job_requeued", "job_admitted"]));
    }

    #[test]
    fn manual_retry_rejected_for_running_job() {
        let h = Harness::new();
        let job = h.submit(0);
        let err = h.service.retry(h.org, job.id).unwrap_err();
        assert!(matches!(err, JobServiceError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn cancel_only_pending_jobs() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(1));

        let running = h.submit(0);
        let waiting = h.submit(0);

        assert!(!h.service.cancel(h.org, running.id).unwrap());
        assert!(h.service.cancel(h.org, waiting.id).unwrap());

        let canceled = h.service.get(h.org, waiting.id).unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::DeadLetter);
        assert_eq!(canceled.error_message.as_deref(), Some(CANCELED_MESSAGE));
        assert_eq!(h.service.queue_summary(h.org).unwrap().canceled, 1);

        assert!(!h.service.cancel(h.org, waiting.id).unwrap());
    }

    #[test]
    fn reporting_on_pending_job_is_rejected() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(0));
        let job = h.submit(0);

        let err = h
            .service
            .report_success(h.org, job.id, serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Domain(DomainError::Validation(_))));
        assert_eq!(h.service.get(h.org, job.id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn other_orgs_cannot_touch_a_job() {
        let h = Harness::new();
        let job = h.submit(0);
        let err = h.service.cancel(OrgId::new(), job.id).unwrap_err();
        assert_eq!(err, JobServiceError::Store(JobStoreError::TenantIsolation));
    }

    #[test]
    fn sweep_admits_after_limit_raised() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(0));
        let job = h.submit(0);

        h.limits.set_org_limit(h.org, None);
        let report = h.service.sweep().unwrap();
        assert_eq!(report, SweepReport { requeued: 0, admitted: 1 });
        assert_eq!(h.service.get(h.org, job.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn racing_outcome_reports_accept_exactly_one() {
        let h = Harness::new();
        let job = h.submit(0);
        h.event_names();
        h.store.slow_reads(StdDuration::from_millis(50));

        let (service, org) = (&h.service, h.org);
        let barrier = Barrier::new(2);
        let outcomes = thread::scope(|scope| {
            let success = scope.spawn(|| {
                barrier.wait();
                service.report_success(org, job.id, serde_json::json!({ "bytes": 1 }))
            });
            let failure = scope.spawn(|| {
                barrier.wait();
                service.report_failure(org, job.id, "connection reset")
            });
            [success.join().unwrap(), failure.join().unwrap()]
        });

        let winners: Vec<&JobRecord> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            loser,
            JobServiceError::Store(JobStoreError::StatusConflict { expected: JobStatus::Running, .. })
        ));

        assert_eq!(h.stored(job.id).status, winners[0].status);
        let outcome_events: Vec<_> = h
            .event_names()
            .into_iter()
            .filter(|name| matches!(*name, "job_completed" | "job_retry_scheduled" | "job_dead_lettered"))
            .collect();
        assert_eq!(outcome_events.len(), 1);
        assert_eq!(h.service.concurrency_status(h.org, h.agent).unwrap().org.running, 0);
    }

    #[test]
    fn completed_job_cannot_be_failed_afterwards() {
        let h = Harness::new();
        let job = h.submit(0);
        h.service.report_success(h.org, job.id, serde_json::Value::Null).unwrap();

        let err = h.service.report_failure(h.org, job.id, "late report").unwrap_err();
        assert!(matches!(err, JobServiceError::Domain(DomainError::Validation(_))));
        assert_eq!(h.stored(job.id).status, JobStatus::Completed);
    }

    #[test]
    fn unreadable_admitted_job_releases_its_slot() {
        let h = Harness::new();
        h.limits.set_org_limit(h.org, Some(1));

        let first = h.submit(0);
        let broken = h.submit(5);
        let next = h.submit(0);
        h.store.break_job(Some(broken.id));

        h.clock.advance(Duration::minutes(4));
        h.service.report_success(h.org, first.id, serde_json::Value::Null).unwrap();

        assert_eq!(h.stored(broken.id).status, JobStatus::Pending);
        assert_eq!(h.stored(next.id).status, JobStatus::Running);
        assert_eq!(h.service.admission().entry_for_job(h.org, broken.id).unwrap(), None);

        let status = h.service.concurrency_status(h.org, h.agent).unwrap();
        assert_eq!(status.org.running, 1);
        // The released entry does not count as a zero-length run.
        let summary = h.service.queue_summary(h.org).unwrap();
        assert_eq!(summary.finished, 1);
        assert_eq!(summary.average_run_secs, Some(240));
    }

    #[test]
    fn sweep_skips_job_it_cannot_requeue() {
        let h = Harness::new();
        let broken = h.submit(0);
        let healthy = h.submit(0);
        h.service.report_failure(h.org, broken.id, "timeout").unwrap();
        h.service.report_failure(h.org, healthy.id, "timeout").unwrap();
        h.store.break_job(Some(broken.id));

        h.clock.advance(Duration::hours(1));
        let report = h.service.sweep().unwrap();
        assert_eq!(report, SweepReport { requeued: 1, admitted: 1 });
        assert_eq!(h.stored(healthy.id).status, JobStatus::Running);
        assert_eq!(h.stored(broken.id).status, JobStatus::Failed);

        h.store.break_job(None);
        let report = h.service.sweep().unwrap();
        assert_eq!(report, SweepReport { requeued: 1, admitted: 1 });
        assert_eq!(h.stored(broken.id).status, JobStatus::Running);
    }

    #[test]
    fn retry_without_schedule_is_rejected() {
        let h = Harness::new();
        let now = h.clock.now();
        let mut job = JobRecord::new_at(h.org, JobKind::Backup, 0, serde_json::json!({}), now)
            .with_agent(h.agent)
            .with_max_retries(0);
        job.start_at(now).unwrap();
        job.fail_at("boom", &RetryPolicy::default(), now).unwrap();
        let job_id = h.store.insert(job).unwrap();

        let err = h.service.retry(h.org, job_id).unwrap_err();
        assert!(matches!(err, JobServiceError::Domain(DomainError::Validation(_))));
        assert_eq!(h.stored(job_id).status, JobStatus::DeadLetter);
        assert!(h.service.admission().entry_for_job(h.org, job_id).unwrap().is_none());
    }
}
