//! Server identity and the router seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, Result};

/// Unique identifier for an agent
pub type AgentId = String;

/// First game port of the multi-instance layout
pub const BASE_GAME_PORT: u16 = 34197;

/// Logical name of one game-server process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where and how to reach one server's remote-execution port
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Logical server name
    pub id: ServerId,
    /// RCON address (host:port)
    pub address: String,
    /// RCON password
    pub password: String,
}

impl ServerEndpoint {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: ServerId::new(id),
            address: address.into(),
            password: password.into(),
        }
    }

    /// Endpoint for instance `n` of a multi-instance deployment.
    ///
    /// Instance `n` listens for players on `34197 + 10 * n` and for RCON one
    /// port above that. Fails when that port does not exist.
    pub fn factorio_instance(n: u16, host: &str, password: impl Into<String>) -> Result<Self> {
        let rcon_port = n
            .checked_mul(10)
            .and_then(|offset| offset.checked_add(BASE_GAME_PORT))
            .and_then(|game_port| game_port.checked_add(1))
            .ok_or_else(|| {
                BridgeError::InvalidConfig(format!("instance {} is beyond the port range", n))
            })?;
        Ok(Self::new(
            format!("instance-{}", n),
            format!("{}:{}", host, rcon_port),
            password,
        ))
    }
}

// Keeps the password out of logs
impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("password", &"***")
            .finish()
    }
}

/// What an agent needs from the server it is routed to
#[derive(Debug, Clone, Default)]
pub struct ServerRequirements {
    /// Agent asking for a server
    pub agent_id: AgentId,
    /// Server to prefer when it has room
    pub preferred: Option<ServerId>,
}

impl ServerRequirements {
    pub fn for_agent(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            preferred: None,
        }
    }
}

/// A server lease handed out by a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    /// Endpoint the agent should talk to
    pub endpoint: ServerEndpoint,
    /// Agent holding the lease
    pub agent_id: AgentId,
}

impl ServerHandle {
    pub fn server_id(&self) -> &ServerId {
        &self.endpoint.id
    }
}

/// Maps agents onto servers.
///
/// The bridge consumes a router but never picks a different server on its
/// own: when a server becomes unavailable the error surfaces to the caller,
/// who may release the handle and acquire another.
#[async_trait]
pub trait ServerRouter: Send + Sync {
    /// Acquire a server for the given requirements
    async fn acquire_server(&self, requirements: &ServerRequirements) -> Result<ServerHandle>;

    /// Release a previously acquired server
    async fn release_server(&self, handle: ServerHandle) -> Result<()>;
}
