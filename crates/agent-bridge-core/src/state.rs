//! Observable world state reported by servers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::operation::EntityRef;

/// Map position in tiles
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Kinds of state the bridge caches per agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKind {
    Player,
    Inventory,
    NearbyEntities,
}

/// Character state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub position: Position,
    /// Handcrafting jobs still queued
    #[serde(default)]
    pub crafting_queue_size: Option<u32>,
}

/// Item name to count
pub type Inventory = BTreeMap<String, u64>;

/// One entity seen in a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub name: String,
    #[serde(default)]
    pub unit_number: Option<u64>,
    pub position: Position,
}

/// Result of scanning for entities around a point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityScan {
    /// Where the scan was taken from
    pub center: Position,
    pub radius: f64,
    #[serde(default)]
    pub entities: Vec<EntitySnapshot>,
}

impl EntityScan {
    /// Whether `position` lies inside the scanned area
    pub fn covers(&self, position: &Position) -> bool {
        self.center.distance(position) <= self.radius
    }

    pub fn contains_ref(&self, entity_ref: EntityRef) -> bool {
        self.entities
            .iter()
            .any(|e| e.unit_number == Some(entity_ref.0))
    }

    /// Whether any entity sits within `epsilon` of `position`
    pub fn any_near(&self, position: &Position, epsilon: f64) -> bool {
        self.entities
            .iter()
            .any(|e| e.position.distance(position) <= epsilon)
    }
}

/// Everything one response revealed about the world.
///
/// Components are `None` when the response did not report them; that means
/// "unknown", not "empty".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedState {
    /// Server tick the response was produced at
    pub tick: Option<u64>,
    pub player: Option<PlayerState>,
    pub inventory: Option<Inventory>,
    pub nearby: Option<EntityScan>,
}

impl ObservedState {
    pub fn is_empty(&self) -> bool {
        self.player.is_none() && self.inventory.is_none() && self.nearby.is_none()
    }

    /// Overlay `other` on top of this state; reported components win
    pub fn merge(&mut self, other: ObservedState) {
        if other.tick.is_some() {
            self.tick = other.tick.max(self.tick);
        }
        if other.player.is_some() {
            self.player = other.player;
        }
        if other.inventory.is_some() {
            self.inventory = other.inventory;
        }
        if other.nearby.is_some() {
            self.nearby = other.nearby;
        }
    }
}
