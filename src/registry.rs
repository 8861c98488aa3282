//! Agent registry — component E.
//!
//! Tracks the fleet of registered agents. `upsert` and `delete` are
//! idempotent; `list` hands out an owned snapshot rather than a lock guard,
//! matching the copy-on-write convention used by the task store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::types::Agent;

/// Identifies which node in a (simulated) cluster owns a given agent's
/// worker. Single-node deployments always resolve to the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLocation {
    pub node_index: u32,
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn fetch(&self, id: &str) -> GatewayResult<Option<Agent>>;
    async fn list(&self) -> GatewayResult<Vec<Agent>>;
    async fn upsert(&self, agent: Agent) -> GatewayResult<()>;
    async fn delete(&self, id: &str) -> GatewayResult<()>;

    /// Resolve which cluster node is responsible for running this agent's
    /// worker. Returns `AgentNotFound` if the agent isn't registered.
    async fn lookup_worker(&self, id: &str, node_count: u32) -> GatewayResult<WorkerLocation>;
}

/// In-memory registry backed by a read-write-locked hash map.
#[derive(Debug, Default)]
pub struct InMemoryAgentRegistry {
    agents: Arc<RwLock<HashMap<String, Agent>>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Deterministic, stable hash used for worker ownership assignment. Not
/// `std::collections::hash_map`'s randomized `DefaultHasher` — ownership
/// decisions must be reproducible across calls and across nodes.
fn stable_hash(s: &str) -> u64 {
    // FNV-1a: simple, deterministic, and dependency-free.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn fetch(&self, id: &str) -> GatewayResult<Option<Agent>> {
        let agents = self.agents.read().await;
        Ok(agents.get(id).cloned())
    }

    async fn list(&self) -> GatewayResult<Vec<Agent>> {
        let agents = self.agents.read().await;
        Ok(agents.values().cloned().collect())
    }

    async fn upsert(&self, agent: Agent) -> GatewayResult<()> {
        agent.validate()?;
        let mut agents = self.agents.write().await;
        let is_new = !agents.contains_key(&agent.id);
        debug!(agent_id = %agent.id, is_new, "agent upserted");
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn delete(&self, id: &str) -> GatewayResult<()> {
        let mut agents = self.agents.write().await;
        let existed = agents.remove(id).is_some();
        debug!(agent_id = %id, existed, "agent delete");
        Ok(())
    }

    async fn lookup_worker(&self, id: &str, node_count: u32) -> GatewayResult<WorkerLocation> {
        let agents = self.agents.read().await;
        if !agents.contains_key(id) {
            return Err(GatewayError::agent_not_found(id));
        }
        let node_count = node_count.max(1);
        let node_index = (stable_hash(id) % node_count as u64) as u32;
        Ok(WorkerLocation { node_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            url: format!("http://agent-{id}.local"),
            token: None,
            tuning: None,
            protocol: "jsonrpc".to_string(),
            protocol_version: "1.0".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let registry = InMemoryAgentRegistry::new();
        registry.upsert(agent("a1")).await.unwrap();
        registry.upsert(agent("a1")).await.unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_rejects_empty_id() {
        let registry = InMemoryAgentRegistry::new();
        let mut bad = agent("");
        bad.id = "".to_string();
        let err = registry.upsert(bad).await.unwrap_err();
        assert_eq!(err.reason(), "invalid");
    }

    #[tokio::test]
    async fn upsert_rejects_non_absolute_url() {
        let registry = InMemoryAgentRegistry::new();
        let mut bad = agent("a1");
        bad.url = "not-a-url".to_string();
        let err = registry.upsert(bad).await.unwrap_err();
        assert_eq!(err.reason(), "invalid");
        assert!(registry.fetch("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let registry = InMemoryAgentRegistry::new();
        registry.delete("missing").await.unwrap();
        registry.upsert(agent("a1")).await.unwrap();
        registry.delete("a1").await.unwrap();
        registry.delete("a1").await.unwrap();
        assert!(registry.fetch("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_worker_is_deterministic() {
        let registry = InMemoryAgentRegistry::new();
        registry.upsert(agent("a1")).await.unwrap();
        let first = registry.lookup_worker("a1", 4).await.unwrap();
        let second = registry.lookup_worker("a1", 4).await.unwrap();
        assert_eq!(first, second);
        assert!(first.node_index < 4);
    }

    #[tokio::test]
    async fn lookup_worker_missing_agent_errors() {
        let registry = InMemoryAgentRegistry::new();
        let err = registry.lookup_worker("ghost", 1).await.unwrap_err();
        assert_eq!(err.code(), -32001);
    }
}
