//! # agent-bridge-core
//!
//! Core types shared by agent bridges.
//!
//! This crate provides the foundational types used across bridge implementations:
//! - Operations and their wire encodings
//! - Structured responses and per-operation results
//! - Observable state (player, inventory, nearby entities)
//! - Error taxonomy with stable error codes
//! - Server identity and the router seam

pub mod error;
pub mod operation;
pub mod response;
pub mod server;
pub mod state;

pub use error::{BridgeError, ErrorCode, Result};
pub use operation::{
    Direction, EntityRef, InventoryRef, MineTarget, Operation, OperationKind, QueryScope,
};
pub use response::{OpResult, Response, Status};
pub use server::{
    AgentId, ServerEndpoint, ServerHandle, ServerId, ServerRequirements, ServerRouter,
};
pub use state::{
    EntityScan, EntitySnapshot, Inventory, ObservedState, PlayerState, Position, StateKind,
};
