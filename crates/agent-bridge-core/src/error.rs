//! Error types for the agent bridge

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::server::ServerId;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Stable error codes reported for every failed operation.
///
/// The serde form is the wire code string the game-side mod emits, so the
/// same enum is used to parse per-operation failures and to classify
/// bridge-side failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Target entity, player or recipe does not exist
    NotFound,
    /// Target is outside the character's reach
    OutOfReach,
    /// Not enough items or ingredients
    InsufficientResources,
    /// Placement collides or the position is invalid
    CollisionOrInvalidPosition,
    /// A single operation cannot fit under the payload ceiling
    PayloadTooLarge,
    /// No session became free before the acquire timeout
    PoolExhausted,
    /// A request did not complete before its deadline
    Timeout,
    /// The response could not be parsed
    MalformedResponse,
    /// The server could not be reached or the connection failed
    ServerUnavailable,
    /// Bridge configuration was rejected
    InvalidConfig,
    /// A code the server sent that this bridge does not know
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Wire representation of the code
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::OutOfReach => "OutOfReach",
            ErrorCode::InsufficientResources => "InsufficientResources",
            ErrorCode::CollisionOrInvalidPosition => "CollisionOrInvalidPosition",
            ErrorCode::PayloadTooLarge => "PayloadTooLarge",
            ErrorCode::PoolExhausted => "PoolExhausted",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::MalformedResponse => "MalformedResponse",
            ErrorCode::ServerUnavailable => "ServerUnavailable",
            ErrorCode::InvalidConfig => "InvalidConfig",
            ErrorCode::Unknown => "Unknown",
        }
    }

    /// Game-logic codes depend on world state and are never retried by the bridge
    pub fn is_game_logic(self) -> bool {
        matches!(
            self,
            ErrorCode::NotFound
                | ErrorCode::OutOfReach
                | ErrorCode::InsufficientResources
                | ErrorCode::CollisionOrInvalidPosition
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge error types
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Rendered operation exceeds the payload ceiling on its own
    #[error("Payload too large: {size} bytes exceeds ceiling of {ceiling}")]
    PayloadTooLarge { size: usize, ceiling: usize },

    /// Every session for the server stayed busy past the acquire timeout
    #[error("Connection pool exhausted for {server} after {waited:?}")]
    PoolExhausted { server: ServerId, waited: Duration },

    /// Request did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Response bytes could not be turned into a response
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Transport failure or server marked unreachable
    #[error("Server {server} unavailable: {reason}")]
    ServerUnavailable { server: ServerId, reason: String },

    /// Error reported by the game for a batch or operation
    #[error("{code}: {message}")]
    Game { code: ErrorCode, message: String },

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeError {
    /// Shorthand for a transport failure against `server`
    pub fn unavailable(server: &ServerId, reason: impl Into<String>) -> Self {
        BridgeError::ServerUnavailable {
            server: server.clone(),
            reason: reason.into(),
        }
    }

    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            BridgeError::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            BridgeError::Timeout(_) => ErrorCode::Timeout,
            BridgeError::MalformedResponse(_) => ErrorCode::MalformedResponse,
            BridgeError::ServerUnavailable { .. } => ErrorCode::ServerUnavailable,
            BridgeError::Game { code, .. } => *code,
            BridgeError::InvalidConfig(_) => ErrorCode::InvalidConfig,
        }
    }

    /// Whether the error leaves the session that produced it unusable
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::ServerUnavailable { .. }
                | BridgeError::Timeout(_)
                | BridgeError::MalformedResponse(_)
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::MalformedResponse(err.to_string())
    }
}
