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

use super::{
    Block, BlockConfig, BlockId, BlockKind, Connection, LoopDef, ParallelDef, ParamType,
    SerializedWorkflow, SubflowId,
};
use crate::errors::SerializeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub const WORKFLOW_VERSION: &str = "1.0";

/// Editor representation: blocks keyed by id with loose sub-block values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditorWorkflowState {
    pub blocks: HashMap<BlockId, EditorBlockState>,
    pub edges: Vec<EditorEdge>,
    #[serde(default)]
    pub loops: HashMap<SubflowId, LoopDef>,
    #[serde(default)]
    pub parallels: HashMap<SubflowId, ParallelDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorBlockState {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub sub_blocks: HashMap<String, SubBlockState>,
    #[serde(default)]
    pub inputs: HashMap<String, ParamType>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubBlockState {
    pub id: String,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorEdge {
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// Produces a concrete default for a parameter from the other resolved
/// params. Registered per (kind, param); consulted only when the stored
/// value is null.
type Defaulter = fn(&HashMap<String, Value>) -> Value;

fn method_default(_: &HashMap<String, Value>) -> Value {
    Value::String("GET".to_string())
}

fn temperature_default(_: &HashMap<String, Value>) -> Value {
    serde_json::json!(0.7)
}

fn timeout_default(_: &HashMap<String, Value>) -> Value {
    serde_json::json!(30)
}

fn defaulter_for(kind: BlockKind, param: &str) -> Option<Defaulter> {
    match (kind, param) {
        (BlockKind::Api, "method") => Some(method_default),
        (BlockKind::Agent, "temperature") => Some(temperature_default),
        (BlockKind::Function, "timeout") => Some(timeout_default),
        _ => None,
    }
}

pub struct Serializer;

impl Serializer {
    /// Translate the persisted editor state into the immutable execution
    /// graph. Blocks land in a `BTreeMap`, so iteration order is by id.
    pub fn serialize(state: &EditorWorkflowState) -> Result<SerializedWorkflow, SerializeError> {
        let mut blocks = BTreeMap::new();

        for (id, editor_block) in &state.blocks {
            let kind = BlockKind::parse(&editor_block.kind).ok_or_else(|| {
                SerializeError::UnknownBlockKind {
                    kind: editor_block.kind.clone(),
                    block_id: id.clone(),
                }
            })?;

            let mut params: HashMap<String, Value> = editor_block
                .sub_blocks
                .iter()
                .filter_map(|(name, sub)| {
                    sub.value.clone().map(|v| (name.clone(), v))
                })
                .collect();

            for (name, sub) in &editor_block.sub_blocks {
                let is_null = sub.value.as_ref().map_or(true, Value::is_null);
                if is_null {
                    if let Some(default) = defaulter_for(kind, name) {
                        params.insert(name.clone(), default(&params));
                    }
                }
            }

            let tool = Self::select_tool(kind, &editor_block.tool, &params);

            blocks.insert(
                id.clone(),
                Block {
                    id: id.clone(),
                    kind,
                    name: editor_block.name.clone(),
                    position: editor_block.position.clone(),
                    config: BlockConfig { tool, params },
                    inputs: editor_block.inputs.clone(),
                    outputs: editor_block.outputs.clone(),
                    enabled: editor_block.enabled,
                },
            );
        }

        let connections = state
            .edges
            .iter()
            .map(|e| Connection {
                source: e.source.clone(),
                target: e.target.clone(),
                source_handle: e.source_handle.clone(),
                target_handle: e.target_handle.clone(),
            })
            .collect();

        let workflow = SerializedWorkflow {
            version: WORKFLOW_VERSION.to_string(),
            blocks,
            connections,
            loops: state.loops.clone(),
            parallels: state.parallels.clone(),
        };

        workflow.validate()?;
        Ok(workflow)
    }

    /// Inverse of [`Serializer::serialize`]; round-trips block set, edge
    /// set with handles, and subflow memberships.
    pub fn deserialize(workflow: &SerializedWorkflow) -> EditorWorkflowState {
        let blocks = workflow
            .blocks
            .values()
            .map(|block| {
                let sub_blocks = block
                    .config
                    .params
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.clone(),
                            SubBlockState {
                                id: name.clone(),
                                value: Some(value.clone()),
                            },
                        )
                    })
                    .collect();
                (
                    block.id.clone(),
                    EditorBlockState {
                        id: block.id.clone(),
                        kind: block.kind.as_str().to_string(),
                        name: block.name.clone(),
                        position: block.position.clone(),
                        tool: block.config.tool.clone(),
                        sub_blocks,
                        inputs: block.inputs.clone(),
                        outputs: block.outputs.clone(),
                        enabled: block.enabled,
                    },
                )
            })
            .collect();

        let edges = workflow
            .connections
            .iter()
            .map(|c| EditorEdge {
                source: c.source.clone(),
                target: c.target.clone(),
                source_handle: c.source_handle.clone(),
                target_handle: c.target_handle.clone(),
            })
            .collect();

        EditorWorkflowState {
            blocks,
            edges,
            loops: workflow.loops.clone(),
            parallels: workflow.parallels.clone(),
        }
    }

    /// Agent blocks carrying a custom-tools list keep an empty tool id;
    /// handlers bind custom tools at runtime. Api blocks fall back to the
    /// built-in HTTP tool.
    fn select_tool(kind: BlockKind, declared: &str, params: &HashMap<String, Value>) -> String {
        match kind {
            BlockKind::Agent => {
                let has_custom_tools = params
                    .get("tools")
                    .and_then(Value::as_array)
                    .is_some_and(|tools| !tools.is_empty());
                if has_custom_tools {
                    String::new()
                } else {
                    declared.to_string()
                }
            }
            BlockKind::Api if declared.is_empty() => "http_request".to_string(),
            _ => declared.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn editor_block(id: &str, kind: &str) -> EditorBlockState {
        EditorBlockState {
            id: id.to_string(),
            kind: kind.to_string(),
            name: id.to_string(),
            position: None,
            tool: String::new(),
            sub_blocks: HashMap::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            enabled: true,
        }
    }

    fn two_block_state() -> EditorWorkflowState {
        let mut blocks = HashMap::new();
        blocks.insert("start".to_string(), editor_block("start", "starter"));
        blocks.insert("fetch".to_string(), editor_block("fetch", "api"));
        EditorWorkflowState {
            blocks,
            edges: vec![EditorEdge {
                source: "start".to_string(),
                target: "fetch".to_string(),
                source_handle: None,
                target_handle: None,
            }],
            loops: HashMap::new(),
            parallels: HashMap::new(),
        }
    }

    #[test]
    fn serializes_blocks_sorted_by_id() {
        let workflow = Serializer::serialize(&two_block_state()).unwrap();
        let ids: Vec<_> = workflow.blocks.keys().cloned().collect();
        assert_eq!(ids, vec!["fetch".to_string(), "start".to_string()]);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut state = two_block_state();
        state
            .blocks
            .insert("odd".to_string(), editor_block("odd", "teleport"));
        let err = Serializer::serialize(&state).unwrap_err();
        assert!(matches!(err, SerializeError::UnknownBlockKind { .. }));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let mut state = two_block_state();
        state.edges.push(EditorEdge {
            source: "fetch".to_string(),
            target: "ghost".to_string(),
            source_handle: None,
            target_handle: None,
        });
        let err = Serializer::serialize(&state).unwrap_err();
        assert!(matches!(err, SerializeError::DanglingEdge { .. }));
    }

    #[test]
    fn missing_starter_is_rejected() {
        let mut state = two_block_state();
        state.blocks.remove("start");
        state.edges.clear();
        let err = Serializer::serialize(&state).unwrap_err();
        assert_eq!(err, SerializeError::MissingStarter);
    }

    #[test]
    fn null_sub_block_values_take_defaults() {
        let mut state = two_block_state();
        let fetch = state.blocks.get_mut("fetch").unwrap();
        fetch.sub_blocks.insert(
            "method".to_string(),
            SubBlockState {
                id: "method".to_string(),
                value: Some(Value::Null),
            },
        );
        let workflow = Serializer::serialize(&state).unwrap();
        assert_eq!(
            workflow.blocks["fetch"].config.params["method"],
            json!("GET")
        );
    }

    #[test]
    fn api_blocks_bind_the_http_tool() {
        let workflow = Serializer::serialize(&two_block_state()).unwrap();
        assert_eq!(workflow.blocks["fetch"].config.tool, "http_request");
    }

    #[test]
    fn agent_with_custom_tools_keeps_tool_empty() {
        let mut state = two_block_state();
        let mut agent = editor_block("writer", "agent");
        agent.tool = "builtin_chat".to_string();
        agent.sub_blocks.insert(
            "tools".to_string(),
            SubBlockState {
                id: "tools".to_string(),
                value: Some(json!([{ "name": "search", "parameters": {} }])),
            },
        );
        state.blocks.insert("writer".to_string(), agent);
        state.edges.push(EditorEdge {
            source: "fetch".to_string(),
            target: "writer".to_string(),
            source_handle: None,
            target_handle: None,
        });
        let workflow = Serializer::serialize(&state).unwrap();
        assert_eq!(workflow.blocks["writer"].config.tool, "");
    }

    #[test]
    fn round_trip_preserves_graph() {
        let mut state = two_block_state();
        state.loops.insert(
            "loop-1".to_string(),
            LoopDef {
                id: "loop-1".to_string(),
                nodes: vec!["fetch".to_string()],
                iterations: 3,
                loop_type: crate::workflow::LoopType::For,
                for_each_items: None,
                condition: None,
            },
        );
        let workflow = Serializer::serialize(&state).unwrap();
        let editor = Serializer::deserialize(&workflow);
        let again = Serializer::serialize(&editor).unwrap();

        assert_eq!(
            workflow.blocks.keys().collect::<Vec<_>>(),
            again.blocks.keys().collect::<Vec<_>>()
        );
        assert_eq!(workflow.connections, again.connections);
        assert_eq!(
            workflow.loops["loop-1"].nodes,
            again.loops["loop-1"].nodes
        );
    }

    #[test]
    fn duplicate_subflow_membership_is_rejected() {
        let mut state = two_block_state();
        state.loops.insert(
            "loop-1".to_string(),
            LoopDef {
                id: "loop-1".to_string(),
                nodes: vec!["fetch".to_string()],
                iterations: 1,
                loop_type: crate::workflow::LoopType::For,
                for_each_items: None,
                condition: None,
            },
        );
        state.parallels.insert(
            "par-1".to_string(),
            ParallelDef {
                id: "par-1".to_string(),
                nodes: vec!["fetch".to_string()],
                parallel_type: crate::workflow::ParallelType::Count,
                count: Some(2),
                distribution: None,
            },
        );
        let err = Serializer::serialize(&state).unwrap_err();
        assert!(matches!(err, SerializeError::DuplicateSubflowMember { .. }));
    }
}
