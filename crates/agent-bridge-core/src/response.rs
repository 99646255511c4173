//! Structured responses to batches

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{BridgeError, ErrorCode, Result};
use crate::state::{EntityScan, Inventory, ObservedState, PlayerState};

/// Outcome of a batch or a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Result of one operation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearby: Option<EntityScan>,
    /// Operation-specific result fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OpResult {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// The failure as a bridge error, if the operation failed
    pub fn error(&self) -> Option<BridgeError> {
        match self.status {
            Status::Success => None,
            Status::Error => Some(BridgeError::Game {
                code: self.code.unwrap_or(ErrorCode::Unknown),
                message: self.message.clone().unwrap_or_default(),
            }),
        }
    }

    fn observed_state(&self) -> ObservedState {
        ObservedState {
            tick: None,
            player: self.player.clone(),
            inventory: self.inventory.clone(),
            nearby: self.nearby.clone(),
        }
    }
}

/// A fully reassembled response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub code: Option<ErrorCode>,
    pub message: Option<String>,
    /// Server tick the batch ran at
    pub tick: Option<u64>,
    /// Per-operation results keyed by index within the batch
    pub results: BTreeMap<usize, OpResult>,
    /// Batch-level data fields that are not operation results
    pub extra: Map<String, Value>,
}

impl Response {
    /// Build a response from wire fields.
    ///
    /// `data` keys that are decimal indices must hold operation results;
    /// anything else is kept as batch-level data.
    pub fn from_wire(
        status: Status,
        code: Option<ErrorCode>,
        message: Option<String>,
        tick: Option<u64>,
        data: Map<String, Value>,
    ) -> Result<Self> {
        let mut results = BTreeMap::new();
        let mut extra = Map::new();

        for (key, value) in data {
            match key.parse::<usize>() {
                Ok(index) => {
                    let result: OpResult = serde_json::from_value(value).map_err(|e| {
                        BridgeError::MalformedResponse(format!(
                            "invalid result for operation {}: {}",
                            index, e
                        ))
                    })?;
                    results.insert(index, result);
                }
                Err(_) => {
                    extra.insert(key, value);
                }
            }
        }

        Ok(Self {
            status,
            code,
            message,
            tick,
            results,
            extra,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Result for the operation at `index` within the batch
    pub fn result(&self, index: usize) -> Option<&OpResult> {
        self.results.get(&index)
    }

    /// Batch-level failure, if the whole batch was rejected
    pub fn error(&self) -> Option<BridgeError> {
        match self.status {
            Status::Success => None,
            Status::Error => Some(BridgeError::Game {
                code: self.code.unwrap_or(ErrorCode::Unknown),
                message: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "batch rejected".to_string()),
            }),
        }
    }

    /// Failed operations as (index, code, message)
    pub fn failures(&self) -> impl Iterator<Item = (usize, ErrorCode, &str)> {
        self.results.iter().filter_map(|(index, result)| {
            if result.is_success() {
                None
            } else {
                Some((
                    *index,
                    result.code.unwrap_or(ErrorCode::Unknown),
                    result.message.as_deref().unwrap_or(""),
                ))
            }
        })
    }

    /// Observable state carried by the response, later operations winning
    pub fn observed_state(&self) -> ObservedState {
        let mut state = ObservedState {
            tick: self.tick,
            ..Default::default()
        };
        for result in self.results.values() {
            state.merge(result.observed_state());
        }
        state
    }
}
