//! Operations an agent can issue against a server

use serde::{Deserialize, Serialize};

use crate::state::{Position, StateKind};

/// Walking direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    Northeast,
    East,
    Southeast,
    South,
    Southwest,
    West,
    Northwest,
}

/// Reference to a specific entity by its unit number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityRef(pub u64);

/// What a `mine` operation targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MineTarget {
    /// Whatever is minable at a map position
    Position { x: f64, y: f64 },
    /// A specific entity
    Entity { entity_ref: EntityRef },
}

/// An inventory that items move between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryRef {
    /// The agent's own character inventory
    Character,
    /// An entity's inventory (chest, furnace, assembler)
    Entity(EntityRef),
}

/// How much state a `query_state` operation reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    /// Position and crafting queue
    Player,
    /// Character inventory contents
    Inventory,
    /// Entities within `radius` of the character
    Nearby { radius: f64 },
    /// Everything above
    All { radius: f64 },
}

/// A single logical instruction.
///
/// Serialized as `{"op": "<kind>", ...fields}`, which is the encoding the
/// game-side mod expects inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Start walking in a direction until stopped
    Move { direction: Direction },
    /// Stop walking, mining and any other continuous action
    Stop,
    /// Move the character instantly
    Teleport { x: f64, y: f64 },
    /// Mine a position or entity until it is gone
    Mine {
        #[serde(flatten)]
        target: MineTarget,
    },
    /// Build an entity from the character inventory
    Place {
        entity_type: String,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },
    /// Queue handcrafting
    Craft { recipe: String, count: u32 },
    /// Move items between inventories
    Transfer {
        item: String,
        count: u32,
        source: InventoryRef,
        target: InventoryRef,
    },
    /// Report observable state
    QueryState { scope: QueryScope },
}

/// Discriminant of [`Operation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Move,
    Stop,
    Teleport,
    Mine,
    Place,
    Craft,
    Transfer,
    QueryState,
}

impl Operation {
    pub fn mine_at(x: f64, y: f64) -> Self {
        Operation::Mine {
            target: MineTarget::Position { x, y },
        }
    }

    pub fn mine_entity(entity_ref: EntityRef) -> Self {
        Operation::Mine {
            target: MineTarget::Entity { entity_ref },
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Move { .. } => OperationKind::Move,
            Operation::Stop => OperationKind::Stop,
            Operation::Teleport { .. } => OperationKind::Teleport,
            Operation::Mine { .. } => OperationKind::Mine,
            Operation::Place { .. } => OperationKind::Place,
            Operation::Craft { .. } => OperationKind::Craft,
            Operation::Transfer { .. } => OperationKind::Transfer,
            Operation::QueryState { .. } => OperationKind::QueryState,
        }
    }

    /// Whether the acknowledgment only means "accepted" and the effect
    /// plays out over later ticks
    pub fn is_multi_tick(&self) -> bool {
        matches!(
            self,
            Operation::Move { .. } | Operation::Mine { .. } | Operation::Craft { .. }
        )
    }

    /// Cached state this operation makes stale once the server accepts it
    pub fn invalidates(&self) -> &'static [StateKind] {
        match self {
            Operation::Move { .. } | Operation::Stop | Operation::Teleport { .. } => {
                &[StateKind::Player]
            }
            Operation::Mine { .. } => &[StateKind::NearbyEntities, StateKind::Inventory],
            Operation::Place { .. } => &[StateKind::NearbyEntities, StateKind::Inventory],
            Operation::Craft { .. } => &[StateKind::Player, StateKind::Inventory],
            Operation::Transfer { .. } => &[StateKind::Inventory],
            Operation::QueryState { .. } => &[],
        }
    }

    /// Map position the operation acts on, if any
    pub fn target_position(&self) -> Option<Position> {
        match self {
            Operation::Teleport { x, y }
            | Operation::Place { x, y, .. }
            | Operation::Mine {
                target: MineTarget::Position { x, y },
            } => Some(Position::new(*x, *y)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_encodings() {
        let json = serde_json::to_value(Operation::Move {
            direction: Direction::North,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"op": "move", "direction": "north"}));

        let json = serde_json::to_value(Operation::Stop).unwrap();
        assert_eq!(json, serde_json::json!({"op": "stop"}));

        let json = serde_json::to_value(Operation::mine_at(5.0, 5.0)).unwrap();
        assert_eq!(json, serde_json::json!({"op": "mine", "x": 5.0, "y": 5.0}));

        let json = serde_json::to_value(Operation::mine_entity(EntityRef(77))).unwrap();
        assert_eq!(json, serde_json::json!({"op": "mine", "entity_ref": 77}));
    }

    #[test]
    fn test_optional_direction_omitted() {
        let op = Operation::Place {
            entity_type: "stone-furnace".to_string(),
            x: 1.5,
            y: -2.5,
            direction: None,
        };
        let serialized = serde_json::to_string(&op).unwrap();
        assert!(serialized.contains("\"op\":\"place\""));
        assert!(!serialized.contains("direction"));
    }

    #[test]
    fn test_transfer_and_query_encoding() {
        let op = Operation::Transfer {
            item: "iron-plate".to_string(),
            count: 10,
            source: InventoryRef::Character,
            target: InventoryRef::Entity(EntityRef(12)),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["source"], "character");
        assert_eq!(json["target"], serde_json::json!({"entity": 12}));

        let op = Operation::QueryState {
            scope: QueryScope::Nearby { radius: 8.0 },
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "query_state");
        assert_eq!(json["scope"], serde_json::json!({"nearby": {"radius": 8.0}}));
    }

    #[test]
    fn test_multi_tick_classification() {
        assert!(Operation::mine_at(0.0, 0.0).is_multi_tick());
        assert!(!Operation::Stop.is_multi_tick());
        assert!(
            !Operation::QueryState {
                scope: QueryScope::Player
            }
            .is_multi_tick()
        );
        assert_eq!(Operation::Stop.invalidates(), &[StateKind::Player]);
    }
}
