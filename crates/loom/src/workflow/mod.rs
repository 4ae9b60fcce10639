// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

pub mod serializer;

use crate::errors::SerializeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub type BlockId = String;
pub type SubflowId = String;

/// Handle names for subflow scaffolding and condition branches.
pub mod handles {
    pub const LOOP_START: &str = "loop-start-source";
    pub const LOOP_END: &str = "loop-end-source";
    pub const PARALLEL_START: &str = "parallel-start-source";
    pub const PARALLEL_END: &str = "parallel-end-source";
    pub const CONDITION_PREFIX: &str = "condition-";

    pub fn is_scaffold(handle: &str) -> bool {
        matches!(
            handle,
            LOOP_START | LOOP_END | PARALLEL_START | PARALLEL_END
        )
    }

    pub fn condition_handle(block_id: &str, branch: &str) -> String {
        format!("{CONDITION_PREFIX}{block_id}-{branch}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Starter,
    Agent,
    Api,
    Function,
    Router,
    Condition,
    Evaluator,
    Response,
    Loop,
    Parallel,
    Workflow,
}

impl BlockKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "starter" => Some(BlockKind::Starter),
            "agent" => Some(BlockKind::Agent),
            "api" => Some(BlockKind::Api),
            "function" => Some(BlockKind::Function),
            "router" => Some(BlockKind::Router),
            "condition" => Some(BlockKind::Condition),
            "evaluator" => Some(BlockKind::Evaluator),
            "response" => Some(BlockKind::Response),
            "loop" => Some(BlockKind::Loop),
            "parallel" => Some(BlockKind::Parallel),
            "workflow" => Some(BlockKind::Workflow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Starter => "starter",
            BlockKind::Agent => "agent",
            BlockKind::Api => "api",
            BlockKind::Function => "function",
            BlockKind::Router => "router",
            BlockKind::Condition => "condition",
            BlockKind::Evaluator => "evaluator",
            BlockKind::Response => "response",
            BlockKind::Loop => "loop",
            BlockKind::Parallel => "parallel",
            BlockKind::Workflow => "workflow",
        }
    }

    pub fn is_subflow_container(&self) -> bool {
        matches!(self, BlockKind::Loop | BlockKind::Parallel)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Json,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default)]
    pub config: BlockConfig,
    #[serde(default)]
    pub inputs: HashMap<String, ParamType>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Block {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.config.params.get(name)
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopType {
    #[serde(rename = "for")]
    For,
    #[serde(rename = "forEach")]
    ForEach,
    #[serde(rename = "while")]
    While,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopDef {
    pub id: SubflowId,
    pub nodes: Vec<BlockId>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    pub loop_type: LoopType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each_items: Option<Value>,
    /// While-loop predicate, resolved and evaluated before each tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_iterations() -> u32 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelType {
    Count,
    Collection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelDef {
    pub id: SubflowId,
    pub nodes: Vec<BlockId>,
    pub parallel_type: ParallelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedWorkflow {
    pub version: String,
    pub blocks: BTreeMap<BlockId, Block>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub loops: HashMap<SubflowId, LoopDef>,
    #[serde(default)]
    pub parallels: HashMap<SubflowId, ParallelDef>,
}

impl SerializedWorkflow {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn kind_of(&self, id: &str) -> Option<BlockKind> {
        self.blocks.get(id).map(|b| b.kind)
    }

    pub fn starter(&self) -> Result<&Block, SerializeError> {
        let mut starters = self
            .blocks
            .values()
            .filter(|b| b.kind == BlockKind::Starter);
        match (starters.next(), starters.next()) {
            (Some(block), None) => Ok(block),
            _ => Err(SerializeError::MissingStarter),
        }
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.source == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.target == id)
    }

    pub fn loop_containing(&self, node: &str) -> Option<&LoopDef> {
        self.loops
            .values()
            .find(|def| def.nodes.iter().any(|n| n == node))
    }

    pub fn parallel_containing(&self, node: &str) -> Option<&ParallelDef> {
        self.parallels
            .values()
            .find(|def| def.nodes.iter().any(|n| n == node))
    }

    /// Inner blocks of a subflow with no outgoing edge to another inner
    /// block; their outputs form the iteration/branch aggregate.
    pub fn subflow_terminals(&self, nodes: &[BlockId]) -> Vec<BlockId> {
        let mut terminals: Vec<BlockId> = nodes
            .iter()
            .filter(|n| {
                !self
                    .outgoing(n.as_str())
                    .any(|c| nodes.contains(&c.target) && c.target != n.as_str())
            })
            .cloned()
            .collect();
        terminals.sort();
        terminals
    }

    /// Entry blocks of a subflow: inner nodes with no incoming edge from
    /// another inner block.
    pub fn subflow_entries(&self, nodes: &[BlockId]) -> Vec<BlockId> {
        let mut entries: Vec<BlockId> = nodes
            .iter()
            .filter(|n| {
                !self
                    .incoming(n.as_str())
                    .any(|c| nodes.contains(&c.source) && c.source != n.as_str())
            })
            .cloned()
            .collect();
        entries.sort();
        entries
    }

    /// Structural validation of the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), SerializeError> {
        self.starter()?;

        for conn in &self.connections {
            if !self.blocks.contains_key(&conn.source) || !self.blocks.contains_key(&conn.target) {
                return Err(SerializeError::DanglingEdge {
                    from: conn.source.clone(),
                    target: conn.target.clone(),
                });
            }
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        for def in self.loops.values() {
            for node in &def.nodes {
                if !self.blocks.contains_key(node) {
                    return Err(SerializeError::DanglingEdge {
                        from: def.id.clone(),
                        target: node.clone(),
                    });
                }
                if seen.insert(node.as_str(), def.id.as_str()).is_some() {
                    return Err(SerializeError::DuplicateSubflowMember {
                        block_id: node.clone(),
                    });
                }
            }
        }
        for def in self.parallels.values() {
            for node in &def.nodes {
                if !self.blocks.contains_key(node) {
                    return Err(SerializeError::DanglingEdge {
                        from: def.id.clone(),
                        target: node.clone(),
                    });
                }
                if seen.insert(node.as_str(), def.id.as_str()).is_some() {
                    return Err(SerializeError::DuplicateSubflowMember {
                        block_id: node.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
