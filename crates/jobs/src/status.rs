//! Read-only projections over the admission queue.
//!
//! Everything here is recomputed from the authoritative entry set on every
//! query; nothing is cached between admission decisions.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stowage_core::{AgentId, OrgId, QueueEntryId};

use crate::entry::{QueueEntry, QueueEntryStatus};

/// Running/queued counts for one scope (an org or an agent).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounters {
    pub running: u32,
    pub queued: u32,
}

impl ScopeCounters {
    /// Whether one more entry may run under `limit` (`None` = unlimited).
    pub fn has_capacity(&self, limit: Option<u32>) -> bool {
        limit.is_none_or(|limit| self.running < limit)
    }
}

/// The dimension whose ceiling currently holds an entry back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum BindingScope {
    Org(OrgId),
    Agent(AgentId),
}

/// Derived position of one queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePosition {
    pub entry_id: QueueEntryId,
    /// 1-based rank within the binding scope.
    pub position: usize,
    pub scope: BindingScope,
    pub estimated_wait_minutes: u64,
}

/// Concurrency view for one (org, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyStatus {
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub org_limit: Option<u32>,
    pub agent_limit: Option<u32>,
    pub org: ScopeCounters,
    pub agent: ScopeCounters,
    /// Whether a new entry for this pair would be admitted immediately.
    pub can_start_now: bool,
    /// Position of this agent's next queued entry, if it has one.
    pub queue_position: Option<usize>,
    pub estimated_wait_minutes: Option<u64>,
}

/// Wait heuristic: `(position - 1) × average duration`, rounded up to whole
/// minutes. Falls back to `default_duration` without history; never divides by
/// zero.
pub fn estimate_wait_minutes(
    position: usize,
    average: Option<Duration>,
    default_duration: StdDuration,
) -> u64 {
    let ahead = position.saturating_sub(1) as u64;
    if ahead == 0 {
        return 0;
    }
    let per_job_secs = match average {
        Some(avg) if avg > Duration::zero() => avg.num_seconds().max(0) as u64,
        _ => default_duration.as_secs(),
    };
    ahead.saturating_mul(per_job_secs).div_ceil(60)
}

/// Average run duration over finished entries, `None` without history.
pub fn average_run_duration<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> Option<Duration> {
    average(entries.into_iter().filter_map(QueueEntry::run_duration))
}

fn average(durations: impl Iterator<Item = Duration>) -> Option<Duration> {
    let (total, count) = durations.fold((0i64, 0i64), |(total, count), d| {
        (total.saturating_add(d.num_milliseconds()), count + 1)
    });
    if count == 0 {
        None
    } else {
        Some(Duration::milliseconds(total / count))
    }
}

/// Aggregate counts over a set of queue entries.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub canceled: usize,
    pub by_org: BTreeMap<OrgId, ScopeCounters>,
    pub by_agent: BTreeMap<AgentId, ScopeCounters>,
    pub oldest_queued_at: Option<DateTime<Utc>>,
    /// Mean time from enqueue to admission over admitted entries.
    pub average_wait_secs: Option<i64>,
    /// Mean run time over finished entries.
    pub average_run_secs: Option<i64>,
}

/// Accumulates a [`QueueSummary`] from entries, possibly across orgs.
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    summary: QueueSummary,
    wait_total_ms: i64,
    wait_count: i64,
    run_total_ms: i64,
    run_count: i64,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: &QueueEntry) {
        let s = &mut self.summary;
        match entry.status {
            QueueEntryStatus::Queued => {
                s.queued += 1;
                s.by_org.entry(entry.org_id).or_default().queued += 1;
                s.by_agent.entry(entry.agent_id).or_default().queued += 1;
                s.oldest_queued_at = Some(match s.oldest_queued_at {
                    Some(oldest) => oldest.min(entry.queued_at),
                    None => entry.queued_at,
                });
            }
            QueueEntryStatus::Started if entry.is_running() => {
                s.running += 1;
                s.by_org.entry(entry.org_id).or_default().running += 1;
                s.by_agent.entry(entry.agent_id).or_default().running += 1;
            }
            QueueEntryStatus::Started => s.finished += 1,
            QueueEntryStatus::Canceled => s.canceled += 1,
        }

        if let Some(wait) = entry.wait_time() {
            self.wait_total_ms = self.wait_total_ms.saturating_add(wait.num_milliseconds());
            self.wait_count += 1;
        }
        if let Some(run) = entry.run_duration() {
            self.run_total_ms = self.run_total_ms.saturating_add(run.num_milliseconds());
            self.run_count += 1;
        }
    }

    pub fn extend<'a>(&mut self, entries: impl IntoIterator<Item = &'a QueueEntry>) {
        for entry in entries {
            self.add(entry);
        }
    }

    pub fn finish(self) -> QueueSummary {
        let mut summary = self.summary;
        summary.average_wait_secs = (self.wait_count > 0).then(|| self.wait_total_ms / self.wait_count / 1000);
        summary.average_run_secs = (self.run_count > 0).then(|| self.run_total_ms / self.run_count / 1000);
        summary
    }
}

/// Summarize a snapshot of entries.
pub fn summarize<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> QueueSummary {
    let mut builder = SummaryBuilder::new();
    builder.extend(entries);
    builder.finish()
}
