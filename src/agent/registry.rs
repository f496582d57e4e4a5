//! Registry of live agents and the listeners that follow their lifecycle.
//!
//! Subsystems that keep per-agent state join the registry as
//! [`LifecycleListener`]s and are told when an agent appears or goes away,
//! so their state is created and dropped in lockstep with the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pool::PoolUsage;
use crate::types::AgentId;

/// Store counters of one agent, published on MEM_USAGE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub agent_id: AgentId,
    pub inbound_ships: PoolUsage,
    pub warp_ships: PoolUsage,
    pub tours: PoolUsage,
}

impl fmt::Display for StoreUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent {}: {}; {}; {}",
            self.agent_id, self.inbound_ships, self.warp_ships, self.tours
        )
    }
}

/// Notified when agents are added to or removed from the registry.
pub trait LifecycleListener: Send + Sync + fmt::Debug {
    fn add(&self, agent_id: AgentId);
    fn remove(&self, agent_id: AgentId);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub multi_core: bool,
}

#[derive(Debug, Default)]
struct RegistryInner {
    agents: BTreeMap<AgentId, AgentInfo>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

/// Agent id to agent info map, shared by `Arc`.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // a panicking holder cannot leave the maps half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.lock().listeners.push(listener);
    }

    /// Register an agent and notify every listener. Returns false if the id
    /// is already registered.
    pub fn register(&self, agent_id: AgentId, multi_core: bool) -> bool {
        let listeners = {
            let mut inner = self.lock();
            if inner.agents.contains_key(&agent_id) {
                return false;
            }
            inner.agents.insert(
                agent_id,
                AgentInfo {
                    agent_id,
                    started_at: Utc::now(),
                    multi_core,
                },
            );
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.add(agent_id);
        }
        tracing::debug!(agent = %agent_id, "agent registered");
        true
    }

    /// Remove an agent and notify every listener. Returns false if the id
    /// was not registered.
    pub fn unregister(&self, agent_id: AgentId) -> bool {
        let listeners = {
            let mut inner = self.lock();
            if inner.agents.remove(&agent_id).is_none() {
                return false;
            }
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.remove(agent_id);
        }
        tracing::debug!(agent = %agent_id, "agent unregistered");
        true
    }

    pub fn get(&self, agent_id: AgentId) -> Option<AgentInfo> {
        self.lock().agents.get(&agent_id).cloned()
    }

    pub fn contains(&self, agent_id: AgentId) -> bool {
        self.lock().agents.contains_key(&agent_id)
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.lock().agents.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().agents.is_empty()
    }
}

/// Latest store usage per agent.
#[derive(Debug, Default)]
pub struct UsageBoard {
    entries: Mutex<BTreeMap<AgentId, Option<StoreUsage>>>,
}

impl UsageBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<AgentId, Option<StoreUsage>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a snapshot. Ignored for agents the board does not follow.
    pub fn publish(&self, usage: StoreUsage) {
        if let Some(slot) = self.entries().get_mut(&usage.agent_id) {
            *slot = Some(usage);
        }
    }

    pub fn get(&self, agent_id: AgentId) -> Option<StoreUsage> {
        self.entries().get(&agent_id).cloned().flatten()
    }

    pub fn tracked(&self) -> Vec<AgentId> {
        self.entries().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<StoreUsage> {
        self.entries().values().filter_map(Clone::clone).collect()
    }
}

impl LifecycleListener for UsageBoard {
    fn add(&self, agent_id: AgentId) {
        self.entries().insert(agent_id, None);
    }

    fn remove(&self, agent_id: AgentId) {
        self.entries().remove(&agent_id);
    }
}
