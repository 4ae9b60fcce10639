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

use super::collection_items;
use crate::context::{BlockOutput, ExecutionContext, ParallelTick};
use crate::errors::ExecutionError;
use crate::resolver::Resolver;
use crate::workflow::{handles, BlockId, ParallelDef, ParallelType, SerializedWorkflow};
use serde_json::Value;

/// Everything the executor needs to fan a parallel block out: branch
/// items, inner entry targets, and the post-join targets.
#[derive(Debug, Clone)]
pub struct ParallelPlan {
    pub subflow_id: String,
    pub branch_count: usize,
    pub items: Vec<Value>,
    pub nodes: Vec<BlockId>,
    pub entry_targets: Vec<BlockId>,
    pub end_targets: Vec<BlockId>,
}

/// Lifecycle controller for fan-out subflows. Planning and joining are
/// pure; the executor owns branch scheduling.
pub struct ParallelManager;

impl ParallelManager {
    pub fn plan(
        workflow: &SerializedWorkflow,
        def: &ParallelDef,
        ctx: &ExecutionContext,
    ) -> Result<ParallelPlan, ExecutionError> {
        let items = match def.parallel_type {
            ParallelType::Count => {
                let count = def.count.unwrap_or(0) as usize;
                vec![Value::Null; count]
            }
            ParallelType::Collection => {
                let raw = def.distribution.clone().unwrap_or(Value::Null);
                let resolver = Resolver::new(workflow);
                let resolved = resolver.resolve_value(&raw, ctx, false)?;
                collection_items(&resolved).ok_or_else(|| ExecutionError::Validation {
                    message: format!(
                        "parallel {} distribution did not resolve to a collection",
                        def.id
                    ),
                    block_id: Some(def.id.clone()),
                })?
            }
        };

        Ok(ParallelPlan {
            subflow_id: def.id.clone(),
            branch_count: items.len(),
            items,
            nodes: def.nodes.clone(),
            entry_targets: workflow
                .outgoing(&def.id)
                .filter(|c| c.source_handle.as_deref() == Some(handles::PARALLEL_START))
                .map(|c| c.target.clone())
                .collect(),
            end_targets: workflow
                .outgoing(&def.id)
                .filter(|c| c.source_handle.as_deref() == Some(handles::PARALLEL_END))
                .map(|c| c.target.clone())
                .collect(),
        })
    }

    /// Join: aggregate branch outputs as an ordered array indexed by
    /// branch number.
    pub fn join(branch_outputs: Vec<Value>) -> BlockOutput {
        let branch_count = branch_outputs.len();
        BlockOutput::Parallel(ParallelTick {
            aggregated: branch_outputs,
            branch_count,
        })
    }

    /// One branch's contribution: the terminal outputs of the inner
    /// subgraph as seen by that branch's context.
    pub fn branch_output(
        workflow: &SerializedWorkflow,
        nodes: &[BlockId],
        branch_ctx: &ExecutionContext,
    ) -> Value {
        let terminals = workflow.subflow_terminals(nodes);
        let mut outputs: Vec<Value> = terminals
            .iter()
            .filter_map(|terminal| branch_ctx.state_of(terminal))
            .map(BlockOutput::as_value)
            .collect();
        match outputs.len() {
            0 => Value::Null,
            1 => outputs.remove(0),
            _ => Value::Array(outputs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerType;
    use crate::workflow::{Block, BlockConfig, BlockKind, Connection};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};

    fn block(id: &str, kind: BlockKind) -> Block {
        Block {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            position: None,
            config: BlockConfig::default(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            enabled: true,
        }
    }

    fn parallel_workflow(def: &ParallelDef) -> SerializedWorkflow {
        let mut blocks = BTreeMap::new();
        blocks.insert("start".to_string(), block("start", BlockKind::Starter));
        blocks.insert("par-1".to_string(), block("par-1", BlockKind::Parallel));
        blocks.insert("inner".to_string(), block("inner", BlockKind::Function));
        blocks.insert("after".to_string(), block("after", BlockKind::Function));
        SerializedWorkflow {
            version: "1.0".to_string(),
            blocks,
            connections: vec![
                Connection {
                    source: "start".to_string(),
                    target: "par-1".to_string(),
                    source_handle: None,
                    target_handle: None,
                },
                Connection {
                    source: "par-1".to_string(),
                    target: "inner".to_string(),
                    source_handle: Some(handles::PARALLEL_START.to_string()),
                    target_handle: None,
                },
                Connection {
                    source: "par-1".to_string(),
                    target: "after".to_string(),
                    source_handle: Some(handles::PARALLEL_END.to_string()),
                    target_handle: None,
                },
            ],
            loops: HashMap::new(),
            parallels: HashMap::from([(def.id.clone(), def.clone())]),
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", TriggerType::Manual, Value::Null)
    }

    #[test]
    fn count_plans_that_many_branches() {
        let def = ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["inner".to_string()],
            parallel_type: ParallelType::Count,
            count: Some(3),
            distribution: None,
        };
        let workflow = parallel_workflow(&def);
        let plan = ParallelManager::plan(&workflow, &def, &ctx()).unwrap();
        assert_eq!(plan.branch_count, 3);
        assert_eq!(plan.entry_targets, vec!["inner".to_string()]);
        assert_eq!(plan.end_targets, vec!["after".to_string()]);
    }

    #[test]
    fn zero_count_plans_no_branches() {
        let def = ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["inner".to_string()],
            parallel_type: ParallelType::Count,
            count: Some(0),
            distribution: None,
        };
        let workflow = parallel_workflow(&def);
        let plan = ParallelManager::plan(&workflow, &def, &ctx()).unwrap();
        assert_eq!(plan.branch_count, 0);

        match ParallelManager::join(Vec::new()) {
            BlockOutput::Parallel(tick) => {
                assert!(tick.aggregated.is_empty());
                assert_eq!(tick.branch_count, 0);
            }
            other => panic!("expected parallel tick, got {other:?}"),
        }
    }

    #[test]
    fn collection_distribution_resolves_items() {
        let def = ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["inner".to_string()],
            parallel_type: ParallelType::Collection,
            count: None,
            distribution: Some(json!(["a", "b"])),
        };
        let workflow = parallel_workflow(&def);
        let plan = ParallelManager::plan(&workflow, &def, &ctx()).unwrap();
        assert_eq!(plan.items, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn join_preserves_branch_order() {
        match ParallelManager::join(vec![json!(0), json!(1), json!(2)]) {
            BlockOutput::Parallel(tick) => {
                assert_eq!(tick.aggregated, vec![json!(0), json!(1), json!(2)]);
                assert_eq!(tick.branch_count, 3);
            }
            other => panic!("expected parallel tick, got {other:?}"),
        }
    }
}
