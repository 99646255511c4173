//! Router over a fixed list of servers

use agent_bridge_core::{
    AgentId, BridgeError, Result, ServerEndpoint, ServerHandle, ServerId, ServerRequirements,
    ServerRouter,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Assignments {
    by_agent: HashMap<AgentId, ServerId>,
    load: HashMap<ServerId, usize>,
    down: HashSet<ServerId>,
}

/// Assigns agents to configured servers.
///
/// An agent keeps its server until released. New agents go to an idle
/// server first, then to the least loaded one still under the per-server
/// cap.
#[derive(Debug)]
pub struct StaticRouter {
    endpoints: Vec<ServerEndpoint>,
    max_agents_per_server: usize,
    assignments: Mutex<Assignments>,
}

impl StaticRouter {
    pub fn new(endpoints: Vec<ServerEndpoint>, max_agents_per_server: usize) -> Self {
        Self {
            endpoints,
            max_agents_per_server,
            assignments: Mutex::new(Assignments::default()),
        }
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.endpoints
    }

    /// Agents currently routed to `server`
    pub fn load(&self, server: &ServerId) -> usize {
        let assignments = self.assignments.lock().unwrap_or_else(PoisonError::into_inner);
        assignments.load.get(server).copied().unwrap_or(0)
    }

    /// Take a server out of (or back into) rotation for new agents
    pub fn set_available(&self, server: &ServerId, available: bool) {
        let mut assignments = self.assignments.lock().unwrap_or_else(PoisonError::into_inner);
        if available {
            assignments.down.remove(server);
        } else {
            info!("Server {} taken out of rotation", server);
            assignments.down.insert(server.clone());
        }
    }

    fn endpoint(&self, server: &ServerId) -> Option<&ServerEndpoint> {
        self.endpoints.iter().find(|endpoint| &endpoint.id == server)
    }

    fn pick(&self, assignments: &Assignments, preferred: Option<&ServerId>) -> Option<ServerId> {
        let load = |id: &ServerId| assignments.load.get(id).copied().unwrap_or(0);
        let eligible = |id: &ServerId| {
            !assignments.down.contains(id) && load(id) < self.max_agents_per_server
        };

        if let Some(preferred) = preferred {
            if self.endpoint(preferred).is_some() && eligible(preferred) {
                return Some(preferred.clone());
            }
        }

        // min_by_key keeps the first of equal loads, so idle servers win in list order
        self.endpoints
            .iter()
            .map(|endpoint| &endpoint.id)
            .filter(|id| eligible(id))
            .min_by_key(|id| load(id))
            .cloned()
    }
}

#[async_trait]
impl ServerRouter for StaticRouter {
    async fn acquire_server(&self, requirements: &ServerRequirements) -> Result<ServerHandle> {
        let mut assignments = self.assignments.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(server) = assignments.by_agent.get(&requirements.agent_id) {
            if let Some(endpoint) = self.endpoint(server) {
                return Ok(ServerHandle {
                    endpoint: endpoint.clone(),
                    agent_id: requirements.agent_id.clone(),
                });
            }
        }

        let Some(server) = self.pick(&assignments, requirements.preferred.as_ref()) else {
            return Err(BridgeError::ServerUnavailable {
                server: requirements
                    .preferred
                    .clone()
                    .unwrap_or_else(|| ServerId::new("any")),
                reason: format!(
                    "no server below {} agents among {} configured",
                    self.max_agents_per_server,
                    self.endpoints.len()
                ),
            });
        };
        let endpoint = match self.endpoint(&server) {
            Some(endpoint) => endpoint.clone(),
            None => return Err(BridgeError::unavailable(&server, "not configured")),
        };

        *assignments.load.entry(server.clone()).or_insert(0) += 1;
        assignments
            .by_agent
            .insert(requirements.agent_id.clone(), server.clone());
        debug!("Routed agent {} to {}", requirements.agent_id, server);

        Ok(ServerHandle {
            endpoint,
            agent_id: requirements.agent_id.clone(),
        })
    }

    async fn release_server(&self, handle: ServerHandle) -> Result<()> {
        let mut assignments = self.assignments.lock().unwrap_or_else(PoisonError::into_inner);

        if assignments.by_agent.get(&handle.agent_id) != Some(handle.server_id()) {
            debug!(
                "Agent {} released {} it did not hold",
                handle.agent_id,
                handle.server_id()
            );
            return Ok(());
        }

        assignments.by_agent.remove(&handle.agent_id);
        if let Some(load) = assignments.load.get_mut(handle.server_id()) {
            *load = load.saturating_sub(1);
        }
        debug!("Agent {} released {}", handle.agent_id, handle.server_id());
        Ok(())
    }
}
