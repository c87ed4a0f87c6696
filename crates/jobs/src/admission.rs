//! Concurrency admission controller.
//!
//! Each organization owns one shard holding its entries and the running/queued
//! counters for the org and every agent inside it. All admission decisions for
//! an org happen under that shard's mutex, so a ceiling can never be exceeded
//! by two concurrent admissions; unrelated orgs never contend.
//!
//! Lock order is always `shards` → shard mutex → `index`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use stowage_core::{
    AgentId, Clock, DomainError, DomainResult, JobId, OrgId, QueueEntryId, SystemClock,
};

use crate::entry::{EnqueueRequest, QueueEntry};
use crate::limits::{ConcurrencyLimits, LimitsProvider};
use crate::ordering::{position_of, queue_order, sort_queued};
use crate::status::{
    BindingScope, ConcurrencyStatus, QueuePosition, QueueSummary, ScopeCounters, SummaryBuilder,
    average_run_duration, estimate_wait_minutes,
};

/// Fallback per-job duration used for wait estimates without history.
pub const DEFAULT_JOB_DURATION: StdDuration = StdDuration::from_secs(30 * 60);

/// Finished/canceled entries retained per org.
pub const DEFAULT_FINISHED_HISTORY: usize = 200;

/// Admission controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub default_job_duration: StdDuration,
    pub finished_history: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_job_duration: DEFAULT_JOB_DURATION,
            finished_history: DEFAULT_FINISHED_HISTORY,
        }
    }
}

impl AdmissionConfig {
    pub fn with_default_job_duration(mut self, duration: StdDuration) -> Self {
        self.default_job_duration = duration;
        self
    }

    pub fn with_finished_history(mut self, limit: usize) -> Self {
        self.finished_history = limit;
        self
    }
}

#[derive(Debug, Default)]
struct OrgShard {
    entries: HashMap<QueueEntryId, QueueEntry>,
    org: ScopeCounters,
    agents: HashMap<AgentId, ScopeCounters>,
    /// Finished or canceled entries, oldest first.
    retired: VecDeque<QueueEntryId>,
    next_seq: u64,
}

impl OrgShard {
    fn agent(&self, agent_id: AgentId) -> ScopeCounters {
        self.agents.get(&agent_id).copied().unwrap_or_default()
    }

    fn agent_mut(&mut self, agent_id: AgentId) -> &mut ScopeCounters {
        self.agents.entry(agent_id).or_default()
    }

    fn get(&self, entry_id: QueueEntryId) -> DomainResult<&QueueEntry> {
        self.entries
            .get(&entry_id)
            .ok_or_else(|| DomainError::not_found(format!("queue entry {entry_id}")))
    }

    fn get_mut(&mut self, entry_id: QueueEntryId) -> DomainResult<&mut QueueEntry> {
        self.entries
            .get_mut(&entry_id)
            .ok_or_else(|| DomainError::not_found(format!("queue entry {entry_id}")))
    }

    fn insert(&mut self, request: EnqueueRequest, now: DateTime<Utc>) -> QueueEntry {
        let entry = QueueEntry::new(request, now, self.next_seq);
        self.next_seq += 1;
        self.org.queued += 1;
        self.agent_mut(entry.agent_id).queued += 1;
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    fn start(&mut self, entry_id: QueueEntryId, now: DateTime<Utc>) -> DomainResult<QueueEntry> {
        let entry = self.get_mut(entry_id)?;
        entry.mark_started(now)?;
        let started = entry.clone();

        self.org.queued = self.org.queued.saturating_sub(1);
        self.org.running += 1;
        let agent = self.agent_mut(started.agent_id);
        agent.queued = agent.queued.saturating_sub(1);
        agent.running += 1;
        Ok(started)
    }

    fn finish(&mut self, entry_id: QueueEntryId, now: DateTime<Utc>) -> DomainResult<QueueEntry> {
        let entry = self.get_mut(entry_id)?;
        entry.mark_finished(now)?;
        let finished = entry.clone();

        self.org.running = self.org.running.saturating_sub(1);
        let agent = self.agent_mut(finished.agent_id);
        agent.running = agent.running.saturating_sub(1);
        self.retired.push_back(entry_id);
        Ok(finished)
    }

    fn cancel(&mut self, entry_id: QueueEntryId, now: DateTime<Utc>) -> DomainResult<QueueEntry> {
        let entry = self.get_mut(entry_id)?;
        entry.mark_canceled(now)?;
        let canceled = entry.clone();

        self.org.queued = self.org.queued.saturating_sub(1);
        let agent = self.agent_mut(canceled.agent_id);
        agent.queued = agent.queued.saturating_sub(1);
        self.retired.push_back(entry_id);
        Ok(canceled)
    }

    /// Drop a running entry without recording it as a run.
    fn release(&mut self, entry_id: QueueEntryId) -> DomainResult<QueueEntry> {
        let entry = self.get(entry_id)?;
        if !entry.is_running() {
            return Err(DomainError::conflict(format!(
                "entry {entry_id} holds no slot (status {})",
                entry.status
            )));
        }
        let Some(released) = self.entries.remove(&entry_id) else {
            return Err(DomainError::not_found(format!("queue entry {entry_id}")));
        };

        self.org.running = self.org.running.saturating_sub(1);
        let agent = self.agent_mut(released.agent_id);
        agent.running = agent.running.saturating_sub(1);
        Ok(released)
    }

    /// Drop retired entries beyond `limit`, oldest first. Returns removed ids.
    fn prune(&mut self, limit: usize) -> Vec<QueueEntryId> {
        let mut removed = Vec::new();
        while self.retired.len() > limit {
            if let Some(id) = self.retired.pop_front() {
                self.entries.remove(&id);
                removed.push(id);
            }
        }
        removed
    }

    fn has_capacity(&self, limits: ConcurrencyLimits, agent_id: AgentId) -> bool {
        self.org.has_capacity(limits.org) && self.agent(agent_id).has_capacity(limits.agent)
    }

    /// Admit queued entries in queue order while the org has capacity.
    ///
    /// An entry held back by its own agent's ceiling is skipped, not waited on.
    fn evaluate(
        &mut self,
        org_id: OrgId,
        limits: &impl LimitsProvider,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<QueueEntry>> {
        let org_limit = limits.org_limit(org_id);
        if self.org.queued == 0 || !self.org.has_capacity(org_limit) {
            return Ok(Vec::new());
        }

        let candidates: Vec<(QueueEntryId, AgentId)> = sort_queued(self.entries.values())
            .into_iter()
            .map(|e| (e.id, e.agent_id))
            .collect();

        let mut agent_limits: HashMap<AgentId, Option<u32>> = HashMap::new();
        let mut admitted = Vec::new();
        for (entry_id, agent_id) in candidates {
            if !self.org.has_capacity(org_limit) {
                break;
            }
            let agent_limit = *agent_limits
                .entry(agent_id)
                .or_insert_with(|| limits.agent_limit(org_id, agent_id));
            if !self.agent(agent_id).has_capacity(agent_limit) {
                continue;
            }
            admitted.push(self.start(entry_id, now)?);
        }
        Ok(admitted)
    }

    /// Position of a queued entry within its binding scope.
    fn position(
        &self,
        entry: &QueueEntry,
        limits: ConcurrencyLimits,
        config: &AdmissionConfig,
    ) -> Option<QueuePosition> {
        let scope = if !self.org.has_capacity(limits.org) {
            BindingScope::Org(entry.org_id)
        } else if !self.agent(entry.agent_id).has_capacity(limits.agent) {
            BindingScope::Agent(entry.agent_id)
        } else {
            BindingScope::Org(entry.org_id)
        };
        let in_scope = |e: &QueueEntry| match scope {
            BindingScope::Org(_) => true,
            BindingScope::Agent(agent_id) => e.agent_id == agent_id,
        };

        let position = position_of(self.entries.values(), entry, &in_scope)?;
        let average = average_run_duration(self.entries.values().filter(|&e| in_scope(e)));
        Some(QueuePosition {
            entry_id: entry.id,
            position,
            scope,
            estimated_wait_minutes: estimate_wait_minutes(
                position,
                average,
                config.default_job_duration,
            ),
        })
    }
}

/// Decides whether queued work may start under org and agent ceilings.
pub struct AdmissionController<L, C = SystemClock> {
    limits: L,
    clock: C,
    config: AdmissionConfig,
    shards: RwLock<HashMap<OrgId, Arc<Mutex<OrgShard>>>>,
    index: RwLock<HashMap<QueueEntryId, OrgId>>,
}

impl<L: LimitsProvider> AdmissionController<L> {
    pub fn new(limits: L) -> Self {
        Self::with_clock(limits, SystemClock)
    }
}

impl<L, C> AdmissionController<L, C>
where
    L: LimitsProvider,
    C: Clock,
{
    pub fn with_clock(limits: L, clock: C) -> Self {
        Self {
            limits,
            clock,
            config: AdmissionConfig::default(),
            shards: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> AdmissionConfig {
        self.config
    }

    pub fn limits(&self) -> &L {
        &self.limits
    }

    /// Insert a queued entry and re-evaluate its org.
    ///
    /// The returned entry reflects the post-evaluation state: `Started` if it
    /// was admitted immediately.
    pub fn enqueue(&self, request: EnqueueRequest) -> DomainResult<QueueEntry> {
        self.enqueue_and_admit(request).map(|(entry, _)| entry)
    }

    /// Like [`enqueue`](Self::enqueue), also returning every entry admitted by
    /// the re-evaluation (the new entry included, if it started).
    pub fn enqueue_and_admit(
        &self,
        request: EnqueueRequest,
    ) -> DomainResult<(QueueEntry, Vec<QueueEntry>)> {
        let org_id = request.org_id;
        let shard = self.shard_or_create(org_id)?;
        let mut guard = lock_shard(&shard)?;
        let now = self.clock.now();

        let entry = {
            let mut index = self
                .index
                .write()
                .map_err(|_| DomainError::unavailable("queue index lock poisoned"))?;
            let entry = guard.insert(request, now);
            index.insert(entry.id, org_id);
            entry
        };

        let admitted = guard.evaluate(org_id, &self.limits, now)?;
        log_admitted(&admitted);

        let current = guard.entries.get(&entry.id).cloned().unwrap_or(entry);
        if current.is_queued() {
            let limits = ConcurrencyLimits::resolve(&self.limits, org_id, current.agent_id);
            let position = guard.position(&current, limits, &self.config);
            debug!(
                org_id = %org_id,
                agent_id = %current.agent_id,
                entry_id = %current.id,
                priority = current.priority,
                position = position.map(|p| p.position),
                "entry queued"
            );
        }
        Ok((current, admitted))
    }

    /// Re-evaluate every org. Returns entries admitted in this pass.
    pub fn admit_sweep(&self) -> DomainResult<Vec<QueueEntry>> {
        let now = self.clock.now();
        let mut admitted = Vec::new();
        for (org_id, shard) in self.snapshot_shards()? {
            let mut guard = lock_shard(&shard)?;
            admitted.extend(guard.evaluate(org_id, &self.limits, now)?);
        }
        log_admitted(&admitted);
        if !admitted.is_empty() {
            info!(admitted = admitted.len(), "admission sweep complete");
        }
        Ok(admitted)
    }

    /// Report successful completion of a started entry; frees its slot.
    pub fn complete(&self, entry_id: QueueEntryId) -> DomainResult<Vec<QueueEntry>> {
        self.finish(entry_id, "completed")
    }

    /// Report failure of a started entry; frees its slot.
    pub fn fail(&self, entry_id: QueueEntryId) -> DomainResult<Vec<QueueEntry>> {
        self.finish(entry_id, "failed")
    }

    fn finish(&self, entry_id: QueueEntryId, outcome: &'static str) -> DomainResult<Vec<QueueEntry>> {
        let (org_id, shard) = self.locate(entry_id)?;
        let mut guard = lock_shard(&shard)?;
        let now = self.clock.now();

        let finished = guard.finish(entry_id, now)?;
        info!(
            org_id = %org_id,
            agent_id = %finished.agent_id,
            entry_id = %entry_id,
            outcome,
            "entry finished, slot released"
        );

        let admitted = guard.evaluate(org_id, &self.limits, now)?;
        log_admitted(&admitted);

        let pruned = guard.prune(self.config.finished_history);
        self.forget(pruned);
        Ok(admitted)
    }

    /// Give back the slot of an admitted entry whose work never ran.
    ///
    /// The entry is dropped outright, so it leaves no trace in run-time
    /// history or summaries. Returns entries admitted into the freed slot.
    pub fn release(&self, entry_id: QueueEntryId) -> DomainResult<Vec<QueueEntry>> {
        let (org_id, shard) = self.locate(entry_id)?;
        let mut guard = lock_shard(&shard)?;
        let now = self.clock.now();

        let released = guard.release(entry_id)?;
        self.forget(vec![entry_id]);
        info!(
            org_id = %org_id,
            agent_id = %released.agent_id,
            entry_id = %entry_id,
            "admitted entry released without running"
        );

        let admitted = guard.evaluate(org_id, &self.limits, now)?;
        log_admitted(&admitted);
        Ok(admitted)
    }

    /// Withdraw an entry that is still queued.
    pub fn cancel(&self, entry_id: QueueEntryId) -> DomainResult<QueueEntry> {
        let (org_id, shard) = self.locate(entry_id)?;
        let mut guard = lock_shard(&shard)?;
        let canceled = guard.cancel(entry_id, self.clock.now())?;
        info!(
            org_id = %org_id,
            agent_id = %canceled.agent_id,
            entry_id = %entry_id,
            "queued entry canceled"
        );

        let pruned = guard.prune(self.config.finished_history);
        self.forget(pruned);
        Ok(canceled)
    }

    /// Start one queued entry out of order if capacity allows.
    ///
    /// Ceilings still apply; without capacity the entry stays queued.
    pub fn try_start(&self, entry_id: QueueEntryId) -> DomainResult<QueueEntry> {
        let (org_id, shard) = self.locate(entry_id)?;
        let mut guard = lock_shard(&shard)?;

        let entry = guard.get(entry_id)?.clone();
        if !entry.is_queued() {
            return Err(DomainError::conflict(format!(
                "entry {entry_id} cannot start from status {}",
                entry.status
            )));
        }

        let limits = ConcurrencyLimits::resolve(&self.limits, org_id, entry.agent_id);
        if !guard.has_capacity(limits, entry.agent_id) {
            debug!(
                org_id = %org_id,
                agent_id = %entry.agent_id,
                entry_id = %entry_id,
                "manual start deferred, no capacity"
            );
            return Ok(entry);
        }

        let started = guard.start(entry_id, self.clock.now())?;
        info!(
            org_id = %org_id,
            agent_id = %started.agent_id,
            entry_id = %entry_id,
            "entry started manually"
        );
        Ok(started)
    }

    /// Concurrency view for an (org, agent) pair.
    pub fn status(&self, org_id: OrgId, agent_id: AgentId) -> DomainResult<ConcurrencyStatus> {
        let limits = ConcurrencyLimits::resolve(&self.limits, org_id, agent_id);
        let mut status = ConcurrencyStatus {
            org_id,
            agent_id,
            org_limit: limits.org,
            agent_limit: limits.agent,
            org: ScopeCounters::default(),
            agent: ScopeCounters::default(),
            can_start_now: false,
            queue_position: None,
            estimated_wait_minutes: None,
        };

        if let Some(shard) = self.shard(org_id)? {
            let guard = lock_shard(&shard)?;
            status.org = guard.org;
            status.agent = guard.agent(agent_id);

            let next = guard
                .entries
                .values()
                .filter(|e| e.agent_id == agent_id && e.is_queued())
                .min_by(|a, b| queue_order(a, b));
            if let Some(position) = next.and_then(|e| guard.position(e, limits, &self.config)) {
                status.queue_position = Some(position.position);
                status.estimated_wait_minutes = Some(position.estimated_wait_minutes);
            }
        }

        status.can_start_now =
            status.org.has_capacity(limits.org) && status.agent.has_capacity(limits.agent);
        Ok(status)
    }

    /// Position and wait estimate of an entry; `None` once it left the queue.
    pub fn position(&self, entry_id: QueueEntryId) -> DomainResult<Option<QueuePosition>> {
        let (org_id, shard) = self.locate(entry_id)?;
        let guard = lock_shard(&shard)?;
        let entry = guard.get(entry_id)?;
        let limits = ConcurrencyLimits::resolve(&self.limits, org_id, entry.agent_id);
        Ok(guard.position(entry, limits, &self.config))
    }

    pub fn entry(&self, entry_id: QueueEntryId) -> DomainResult<QueueEntry> {
        let (_, shard) = self.locate(entry_id)?;
        let guard = lock_shard(&shard)?;
        guard.get(entry_id).cloned()
    }

    /// The queued or running entry admitting `job_id`, if any.
    pub fn entry_for_job(&self, org_id: OrgId, job_id: JobId) -> DomainResult<Option<QueueEntry>> {
        let Some(shard) = self.shard(org_id)? else {
            return Ok(None);
        };
        let guard = lock_shard(&shard)?;
        Ok(guard
            .entries
            .values()
            .find(|e| e.job_id == Some(job_id) && (e.is_queued() || e.is_running()))
            .cloned())
    }

    /// All retained entries of an org, in insertion order.
    pub fn entries(&self, org_id: OrgId) -> DomainResult<Vec<QueueEntry>> {
        let Some(shard) = self.shard(org_id)? else {
            return Ok(Vec::new());
        };
        let guard = lock_shard(&shard)?;
        let mut entries: Vec<QueueEntry> = guard.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    pub fn summary(&self, org_id: OrgId) -> DomainResult<QueueSummary> {
        let mut builder = SummaryBuilder::new();
        if let Some(shard) = self.shard(org_id)? {
            let guard = lock_shard(&shard)?;
            builder.extend(guard.entries.values());
        }
        Ok(builder.finish())
    }

    /// Summary across every org. Each org is read under its own lock.
    pub fn summary_all(&self) -> DomainResult<QueueSummary> {
        let mut builder = SummaryBuilder::new();
        for (_, shard) in self.snapshot_shards()? {
            let guard = lock_shard(&shard)?;
            builder.extend(guard.entries.values());
        }
        Ok(builder.finish())
    }

    fn shard(&self, org_id: OrgId) -> DomainResult<Option<Arc<Mutex<OrgShard>>>> {
        let shards = self
            .shards
            .read()
            .map_err(|_| DomainError::unavailable("shard map lock poisoned"))?;
        Ok(shards.get(&org_id).cloned())
    }

    fn shard_or_create(&self, org_id: OrgId) -> DomainResult<Arc<Mutex<OrgShard>>> {
        if let Some(shard) = self.shard(org_id)? {
            return Ok(shard);
        }
        let mut shards = self
            .shards
            .write()
            .map_err(|_| DomainError::unavailable("shard map lock poisoned"))?;
        Ok(Arc::clone(shards.entry(org_id).or_default()))
    }

    fn snapshot_shards(&self) -> DomainResult<Vec<(OrgId, Arc<Mutex<OrgShard>>)>> {
        let shards = self
            .shards
            .read()
            .map_err(|_| DomainError::unavailable("shard map lock poisoned"))?;
        Ok(shards.iter().map(|(org_id, shard)| (*org_id, Arc::clone(shard))).collect())
    }

    fn locate(&self, entry_id: QueueEntryId) -> DomainResult<(OrgId, Arc<Mutex<OrgShard>>)> {
        let org_id = {
            let index = self
                .index
                .read()
                .map_err(|_| DomainError::unavailable("queue index lock poisoned"))?;
            index.get(&entry_id).copied()
        };
        let not_found = || DomainError::not_found(format!("queue entry {entry_id}"));
        let org_id = org_id.ok_or_else(not_found)?;
        let shard = self.shard(org_id)?.ok_or_else(not_found)?;
        Ok((org_id, shard))
    }

    fn forget(&self, pruned: Vec<QueueEntryId>) {
        if pruned.is_empty() {
            return;
        }
        // A stale index entry only turns a later lookup into NotFound.
        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
        for entry_id in pruned {
            index.remove(&entry_id);
        }
    }
}

fn lock_shard(shard: &Mutex<OrgShard>) -> DomainResult<MutexGuard<'_, OrgShard>> {
    shard
        .lock()
        .map_err(|_| DomainError::unavailable("org shard lock poisoned"))
}

fn log_admitted(admitted: &[QueueEntry]) {
    for entry in admitted {
        info!(
            org_id = %entry.org_id,
            agent_id = %entry.agent_id,
            entry_id = %entry.id,
            priority = entry.priority,
            "entry admitted"
        );
    }
}
