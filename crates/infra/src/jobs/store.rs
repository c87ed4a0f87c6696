//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use stowage_core::{DomainError, JobId, OrgId};
use stowage_jobs::{JobRecord, JobStatus};

/// Job store abstraction.
///
/// Reads and writes are org-scoped: touching another org's job is a
/// [`JobStoreError::TenantIsolation`] error, never a silent miss.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, org_id: OrgId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Replace a stored job with `job`.
    fn update(&self, job: &JobRecord) -> Result<(), JobStoreError>;

    /// Replace a stored job only while it is still in `expected` status.
    ///
    /// This is the write every lifecycle transition goes through: of two
    /// callers that loaded the same record, only the first one lands.
    fn update_if(&self, job: &JobRecord, expected: JobStatus) -> Result<(), JobStoreError>;

    /// List an org's jobs, optionally filtered by status, oldest first.
    fn list_by_status(
        &self,
        org_id: OrgId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Failed jobs (any org) whose backoff has elapsed at `now`, earliest due first.
    fn ready_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Dead-lettered jobs of an org, most recent first.
    fn list_dead_letters(&self, org_id: OrgId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Per-status job counts for an org.
    fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} changed concurrently: expected {expected}, found {actual}")]
    StatusConflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.dead_letter
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, org_id: OrgId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        match jobs.get(&job_id) {
            Some(job) if job.org_id == org_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.org_id == job.org_id => {
                *existing = job.clone();
                Ok(())
            }
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn update_if(&self, job: &JobRecord, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.org_id != job.org_id => Err(JobStoreError::TenantIsolation),
            Some(existing) if existing.status != expected => Err(JobStoreError::StatusConflict {
                job_id: job.id,
                expected,
                actual: existing.status,
            }),
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn list_by_status(
        &self,
        org_id: OrgId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.org_id == org_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    fn ready_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.ready_for_retry(now))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.next_retry_at, j.created_at));
        result.truncate(limit);
        Ok(result)
    }

    fn list_dead_letters(&self, org_id: OrgId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.org_id == org_id && j.status == JobStatus::DeadLetter)
            .cloned()
            .collect();

        result.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.org_id == org_id) {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::DeadLetter => stats.dead_letter += 1,
            }
        }

        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, org_id: OrgId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(org_id, job_id)
    }

    fn update(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn update_if(&self, job: &JobRecord, expected: JobStatus) -> Result<(), JobStoreError> {
        (**self).update_if(job, expected)
    }

    fn list_by_status(
        &self,
        org_id: OrgId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_status(org_id, status, limit)
    }

    fn ready_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).ready_for_retry(now, limit)
    }

    fn list_dead_letters(&self, org_id: OrgId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_dead_letters(org_id, limit)
    }

    fn stats(&self, org_id: OrgId) -> Result<JobStats, JobStoreError> {
        (**self).stats(org_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use stowage_jobs::{JobKind, RetryPolicy};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn job(org: OrgId) -> JobRecord {
        JobRecord::new_at(org, JobKind::Backup, 0, serde_json::json!({}), t0())
    }

    #[test]
    fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let org = OrgId::new();

        let job_id = store.insert(job(org)).unwrap();
        let loaded = store.get(org, job_id).unwrap().unwrap();
        assert_eq!(loaded.id, job_id);
        assert_eq!(loaded.status, JobStatus::Pending);

        assert_eq!(store.get(org, JobId::new()).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryJobStore::new();
        let record = job(OrgId::new());
        store.insert(record.clone()).unwrap();
        assert_eq!(store.insert(record.clone()), Err(JobStoreError::AlreadyExists(record.id)));
    }

    #[test]
    fn tenant_isolation() {
        let store = InMemoryJobStore::new();
        let org1 = OrgId::new();
        let org2 = OrgId::new();

        let job_id = store.insert(job(org1)).unwrap();
        assert_eq!(store.get(org2, job_id), Err(JobStoreError::TenantIsolation));

        let mut forged = store.get(org1, job_id).unwrap().unwrap();
        forged.org_id = org2;
        assert_eq!(store.update(&forged), Err(JobStoreError::TenantIsolation));

        assert!(store.list_by_status(org2, None, 10).unwrap().is_empty());
        assert_eq!(store.stats(org2).unwrap().total(), 0);
    }

    #[test]
    fn conditional_update_rejects_stale_status() {
        let store = InMemoryJobStore::new();
        let org = OrgId::new();
        let job_id = store.insert(job(org)).unwrap();

        let mut first = store.get(org, job_id).unwrap().unwrap();
        let mut second = first.clone();
        first.start_at(t0()).unwrap();
        second.start_at(t0() + Duration::seconds(1)).unwrap();

        store.update_if(&first, JobStatus::Pending).unwrap();
        assert_eq!(
            store.update_if(&second, JobStatus::Pending),
            Err(JobStoreError::StatusConflict {
                job_id,
                expected: JobStatus::Pending,
                actual: JobStatus::Running,
            })
        );
        assert_eq!(store.get(org, job_id).unwrap().unwrap().started_at, Some(t0()));

        let mut forged = first.clone();
        forged.org_id = OrgId::new();
        assert_eq!(store.update_if(&forged, JobStatus::Running), Err(JobStoreError::TenantIsolation));
    }

    #[test]
    fn update_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let record = job(OrgId::new());
        assert_eq!(store.update(&record), Err(JobStoreError::NotFound(record.id)));
    }

    #[test]
    fn ready_for_retry_respects_backoff() {
        let store = InMemoryJobStore::new();
        let org = OrgId::new();
        let policy = RetryPolicy::default();

        let mut failed = job(org);
        failed.start_at(t0()).unwrap();
        failed.fail_at("io error", &policy, t0()).unwrap();
        store.insert(failed.clone()).unwrap();
        store.insert(job(org)).unwrap();

        assert!(store.ready_for_retry(t0() + Duration::seconds(29), 10).unwrap().is_empty());
        let ready = store.ready_for_retry(t0() + Duration::seconds(30), 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, failed.id);
    }

    #[test]
    fn dead_letters_and_stats() {
        let store = InMemoryJobStore::new();
        let org = OrgId::new();

        let mut canceled = job(org);
        assert!(canceled.cancel_at(t0()));
        store.insert(canceled.clone()).unwrap();

        let mut running = job(org);
        running.start_at(t0()).unwrap();
        store.insert(running).unwrap();
        store.insert(job(org)).unwrap();

        let dead = store.list_dead_letters(org, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, canceled.id);

        let stats = store.stats(org).unwrap();
        assert_eq!(
            stats,
            JobStats {
                pending: 1,
                running: 1,
                dead_letter: 1,
                ..JobStats::default()
            }
        );
        assert_eq!(store.list_by_status(org, Some(JobStatus::Running), 10).unwrap().len(), 1);
        assert_eq!(store.list_by_status(org, None, 2).unwrap().len(), 2);
    }
}
