// Agent registry - name/version to endpoint resolution

//! # Agent Registry
//!
//! Read-mostly mapping from [`AgentRef`] to [`AgentEndpoint`]. Resolution
//! happens on every invocation, so admin updates take effect for the next
//! call, never for in-flight calls.
//!
//! ## Shared-resource policy
//!
//! The map is copy-on-write: readers clone an `Arc` snapshot and never
//! block; `register`/`deregister` rebuild the map and swap the pointer
//! atomically under a short write lock. No lock is ever held across a
//! network call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{AgentEndpoint, AgentRef, HealthStatus};

type Snapshot = Arc<HashMap<AgentRef, AgentEndpoint>>;

/// Registry of live agent endpoints
#[derive(Default)]
pub struct AgentRegistry {
    endpoints: RwLock<Snapshot>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; safe to hold across an agent call
    pub fn snapshot(&self) -> Snapshot {
        self.endpoints.read().unwrap().clone()
    }

    /// Resolve an agent reference against the current snapshot
    pub fn resolve(&self, agent: &AgentRef) -> Option<AgentEndpoint> {
        self.snapshot().get(agent).cloned()
    }

    /// Register or replace an endpoint; takes effect for the next
    /// resolution
    pub fn register(&self, endpoint: AgentEndpoint) {
        let mut guard = self.endpoints.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(endpoint.agent.clone(), endpoint);
        *guard = Arc::new(next);
    }

    /// Remove an endpoint; returns whether it existed
    pub fn deregister(&self, agent: &AgentRef) -> bool {
        let mut guard = self.endpoints.write().unwrap();
        if !guard.contains_key(agent) {
            return false;
        }
        let mut next = (**guard).clone();
        next.remove(agent);
        *guard = Arc::new(next);
        true
    }

    /// Update the health marker on a registered endpoint
    pub fn set_health(&self, agent: &AgentRef, health: HealthStatus) -> bool {
        let mut guard = self.endpoints.write().unwrap();
        if !guard.contains_key(agent) {
            return false;
        }
        let mut next = (**guard).clone();
        if let Some(endpoint) = next.get_mut(agent) {
            endpoint.health = health;
        }
        *guard = Arc::new(next);
        true
    }

    /// All registered endpoints
    pub fn list(&self) -> Vec<AgentEndpoint> {
        self.snapshot().values().cloned().collect()
    }
}
