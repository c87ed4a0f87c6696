//! Concurrency ceilings supplied by the organization/agent registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use stowage_core::{AgentId, OrgId};

/// Source of configured concurrency ceilings.
///
/// `None` means unlimited. An unset agent ceiling adds no constraint beyond the
/// organization's.
pub trait LimitsProvider: Send + Sync {
    fn org_limit(&self, org_id: OrgId) -> Option<u32>;

    fn agent_limit(&self, org_id: OrgId, agent_id: AgentId) -> Option<u32>;
}

impl<P> LimitsProvider for Arc<P>
where
    P: LimitsProvider + ?Sized,
{
    fn org_limit(&self, org_id: OrgId) -> Option<u32> {
        (**self).org_limit(org_id)
    }

    fn agent_limit(&self, org_id: OrgId, agent_id: AgentId) -> Option<u32> {
        (**self).agent_limit(org_id, agent_id)
    }
}

/// Both ceilings that apply to one (org, agent) pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub org: Option<u32>,
    pub agent: Option<u32>,
}

impl ConcurrencyLimits {
    pub fn resolve(provider: &impl LimitsProvider, org_id: OrgId, agent_id: AgentId) -> Self {
        Self {
            org: provider.org_limit(org_id),
            agent: provider.agent_limit(org_id, agent_id),
        }
    }
}

/// In-memory registry of ceilings for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLimits {
    orgs: RwLock<HashMap<OrgId, u32>>,
    agents: RwLock<HashMap<(OrgId, AgentId), u32>>,
}

impl InMemoryLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Set (or with `None`, clear) an organization ceiling.
    pub fn set_org_limit(&self, org_id: OrgId, limit: Option<u32>) {
        let mut orgs = self.orgs.write().unwrap_or_else(|p| p.into_inner());
        match limit {
            Some(limit) => orgs.insert(org_id, limit),
            None => orgs.remove(&org_id),
        };
    }

    /// Set (or with `None`, clear) an agent ceiling.
    pub fn set_agent_limit(&self, org_id: OrgId, agent_id: AgentId, limit: Option<u32>) {
        let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
        match limit {
            Some(limit) => agents.insert((org_id, agent_id), limit),
            None => agents.remove(&(org_id, agent_id)),
        };
    }
}

impl LimitsProvider for InMemoryLimits {
    fn org_limit(&self, org_id: OrgId) -> Option<u32> {
        let orgs = self.orgs.read().unwrap_or_else(|p| p.into_inner());
        orgs.get(&org_id).copied()
    }

    fn agent_limit(&self, org_id: OrgId, agent_id: AgentId) -> Option<u32> {
        let agents = self.agents.read().unwrap_or_else(|p| p.into_inner());
        agents.get(&(org_id, agent_id)).copied()
    }
}
