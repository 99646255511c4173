//! Packing operations into RCON-sized batches
//!
//! A batch is rendered as one `/sc` command that hands the JSON-encoded
//! operation list to the mod's remote interface and prints the JSON result:
//!
//! ```text
//! /sc rcon.print(helpers.table_to_json(remote.call("agent_bridge","execute_batch","<agent>","[...]")))
//! ```
//!
//! Escaping the operation array as a Lua string literal is done per
//! character, so the rendered length of a batch is exactly the frame plus
//! the escaped length of each operation plus one separator between them.

use crate::config::BridgeConfig;
use agent_bridge_core::{AgentId, BridgeError, Operation, Result};
use tracing::debug;

const BATCH_FUNCTION: &str = "execute_batch";
const SUFFIX: &str = "\")))";

/// Operations for one request, in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    agent: AgentId,
    /// Index of the first operation within the submitted sequence
    first_index: usize,
    operations: Vec<Operation>,
    payload: String,
}

impl Batch {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn first_index(&self) -> usize {
        self.first_index
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// The rendered `/sc` command
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Rendered length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Groups operations into batches under the payload ceiling
#[derive(Debug, Clone)]
pub struct CommandBatcher {
    ceiling: usize,
    remote_interface: String,
}

impl CommandBatcher {
    pub fn new(ceiling: usize, remote_interface: impl Into<String>) -> Self {
        Self {
            ceiling,
            remote_interface: remote_interface.into(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.payload_ceiling, config.remote_interface.clone())
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    fn prefix(&self, agent: &str) -> String {
        format!(
            "/sc rcon.print(helpers.table_to_json(remote.call(\"{}\",\"{}\",\"{}\",\"",
            lua_escape(&self.remote_interface),
            BATCH_FUNCTION,
            lua_escape(agent)
        )
    }

    /// Split `operations` into batches that each fit under the ceiling.
    ///
    /// Order is preserved within and across batches. If any single
    /// operation cannot fit on its own the whole submission is rejected
    /// with `PayloadTooLarge` and no batch is produced.
    pub fn submit(&self, agent: &str, operations: Vec<Operation>) -> Result<Vec<Batch>> {
        let prefix = self.prefix(agent);
        // Prefix, the brackets of the array and the closing calls
        let frame = prefix.len() + 2 + SUFFIX.len();

        let mut batches = Vec::new();
        let mut current: Vec<(Operation, String)> = Vec::new();
        let mut current_len = frame;
        let mut first_index = 0;

        for (index, operation) in operations.into_iter().enumerate() {
            let encoded = lua_escape(&serde_json::to_string(&operation)?);

            let alone = frame + encoded.len();
            if alone > self.ceiling {
                return Err(BridgeError::PayloadTooLarge {
                    size: alone,
                    ceiling: self.ceiling,
                });
            }

            let separator = usize::from(!current.is_empty());
            if current_len + separator + encoded.len() > self.ceiling {
                let sealed = std::mem::take(&mut current);
                batches.push(seal(agent, &prefix, first_index, sealed, current_len));
                current_len = frame;
                first_index = index;
            }

            current_len += usize::from(!current.is_empty()) + encoded.len();
            current.push((operation, encoded));
        }

        if !current.is_empty() {
            batches.push(seal(agent, &prefix, first_index, current, current_len));
        }

        debug!(
            "Agent {} submission packed into {} batch(es)",
            agent,
            batches.len()
        );
        Ok(batches)
    }
}

fn seal(
    agent: &str,
    prefix: &str,
    first_index: usize,
    entries: Vec<(Operation, String)>,
    expected_len: usize,
) -> Batch {
    let mut payload = String::with_capacity(expected_len);
    payload.push_str(prefix);
    payload.push('[');
    let mut operations = Vec::with_capacity(entries.len());
    for (i, (operation, encoded)) in entries.into_iter().enumerate() {
        if i > 0 {
            payload.push(',');
        }
        payload.push_str(&encoded);
        operations.push(operation);
    }
    payload.push(']');
    payload.push_str(SUFFIX);
    debug_assert_eq!(payload.len(), expected_len);

    Batch {
        agent: agent.to_string(),
        first_index,
        operations,
        payload,
    }
}

/// Escape text for the inside of a double-quoted Lua string literal
pub fn lua_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_control() => out.push_str(&format!("\\{:03}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
