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
use crate::context::{BlockOutput, ExecutionContext, LoopTick};
use crate::errors::ExecutionError;
use crate::logging::log_subflow_event;
use crate::resolver::{expr, Resolver};
use crate::workflow::{handles, BlockId, LoopDef, LoopType, SerializedWorkflow};
use serde_json::Value;

pub struct LoopTickResult {
    pub output: BlockOutput,
    /// Targets to activate: inner entries while advancing, end-edge
    /// targets once completed.
    pub activate: Vec<BlockId>,
    pub completed: bool,
}

/// Lifecycle controller for iterative subflows. The loop block drives
/// iteration by being re-entered as part of the active path.
pub struct LoopManager;

impl LoopManager {
    pub fn tick(
        workflow: &SerializedWorkflow,
        def: &LoopDef,
        ctx: &mut ExecutionContext,
    ) -> Result<LoopTickResult, ExecutionError> {
        let started = ctx.loop_iterations.contains_key(&def.id);
        if !started {
            Self::initialize(workflow, def, ctx)?;
        }

        let max = ctx
            .loop_max_iterations
            .get(&def.id)
            .copied()
            .unwrap_or(def.iterations);
        let iter = ctx.loop_iterations.get(&def.id).copied().unwrap_or(0);

        // Fold the finished iteration's terminal outputs into the
        // aggregate before any reset.
        if iter > 0 {
            Self::collect_results(workflow, def, ctx);
        }

        let advancing = iter < max && Self::predicate_holds(workflow, def, ctx)?;

        if advancing {
            if iter > 0 {
                ctx.reset_inner_blocks(&def.nodes);
            }

            let item = match def.loop_type {
                LoopType::ForEach => ctx
                    .loop_collections
                    .get(&def.id)
                    .and_then(|items| items.get(iter as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                LoopType::For | LoopType::While => Value::from(iter),
            };
            ctx.loop_items.insert(def.id.clone(), item);
            ctx.loop_iterations.insert(def.id.clone(), iter + 1);

            log_subflow_event(&def.id, "loop_tick", iter);

            Ok(LoopTickResult {
                output: BlockOutput::Loop(LoopTick {
                    current_iteration: iter,
                    max_iterations: max,
                    completed: false,
                }),
                activate: start_targets(workflow, &def.id),
                completed: false,
            })
        } else {
            ctx.completed_loops.insert(def.id.clone());
            log_subflow_event(&def.id, "loop_completed", iter);

            Ok(LoopTickResult {
                output: BlockOutput::Loop(LoopTick {
                    current_iteration: iter,
                    max_iterations: max,
                    completed: true,
                }),
                activate: end_targets(workflow, &def.id),
                completed: true,
            })
        }
    }

    fn initialize(
        workflow: &SerializedWorkflow,
        def: &LoopDef,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let max = match def.loop_type {
            LoopType::For | LoopType::While => def.iterations,
            LoopType::ForEach => {
                let raw = def.for_each_items.as_ref().ok_or_else(|| {
                    ExecutionError::ForEachMissingCollection {
                        subflow_id: def.id.clone(),
                    }
                })?;

                let resolver = Resolver::new(workflow);
                let resolved = resolver.resolve_value(raw, ctx, false)?;
                let items = collection_items(&resolved).ok_or_else(|| {
                    ExecutionError::ForEachMissingCollection {
                        subflow_id: def.id.clone(),
                    }
                })?;
                if items.is_empty() {
                    return Err(ExecutionError::ForEachEmpty {
                        subflow_id: def.id.clone(),
                    });
                }

                // Bound by the collection, never by `iterations`.
                let len = items.len() as u32;
                ctx.loop_collections.insert(def.id.clone(), items);
                len
            }
        };

        ctx.loop_max_iterations.insert(def.id.clone(), max);
        ctx.loop_iterations.insert(def.id.clone(), 0);
        ctx.loop_results.entry(def.id.clone()).or_default();
        Ok(())
    }

    fn predicate_holds(
        workflow: &SerializedWorkflow,
        def: &LoopDef,
        ctx: &ExecutionContext,
    ) -> Result<bool, ExecutionError> {
        if def.loop_type != LoopType::While {
            return Ok(true);
        }
        let Some(condition) = &def.condition else {
            return Ok(true);
        };
        let resolver = Resolver::new(workflow);
        let value = resolver.resolve_expression(condition, ctx)?;
        Ok(expr::truthy(&value))
    }

    fn collect_results(workflow: &SerializedWorkflow, def: &LoopDef, ctx: &mut ExecutionContext) {
        let terminals = workflow.subflow_terminals(&def.nodes);
        let mut collected = Vec::new();
        for terminal in terminals {
            if let Some(state) = ctx.state_of(&terminal) {
                collected.push(state.as_value());
            }
        }
        if let Some(results) = ctx.loop_results.get_mut(&def.id) {
            results.extend(collected);
        }
    }
}

fn start_targets(workflow: &SerializedWorkflow, loop_id: &str) -> Vec<BlockId> {
    workflow
        .outgoing(loop_id)
        .filter(|c| c.source_handle.as_deref() == Some(handles::LOOP_START))
        .map(|c| c.target.clone())
        .collect()
}

fn end_targets(workflow: &SerializedWorkflow, loop_id: &str) -> Vec<BlockId> {
    workflow
        .outgoing(loop_id)
        .filter(|c| c.source_handle.as_deref() == Some(handles::LOOP_END))
        .map(|c| c.target.clone())
        .collect()
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

    fn loop_workflow(def: &LoopDef) -> SerializedWorkflow {
        let mut blocks = BTreeMap::new();
        blocks.insert("start".to_string(), block("start", BlockKind::Starter));
        blocks.insert("loop-1".to_string(), block("loop-1", BlockKind::Loop));
        blocks.insert("inner".to_string(), block("inner", BlockKind::Function));
        blocks.insert("after".to_string(), block("after", BlockKind::Function));
        SerializedWorkflow {
            version: "1.0".to_string(),
            blocks,
            connections: vec![
                Connection {
                    source: "start".to_string(),
                    target: "loop-1".to_string(),
                    source_handle: None,
                    target_handle: None,
                },
                Connection {
                    source: "loop-1".to_string(),
                    target: "inner".to_string(),
                    source_handle: Some(handles::LOOP_START.to_string()),
                    target_handle: None,
                },
                Connection {
                    source: "loop-1".to_string(),
                    target: "after".to_string(),
                    source_handle: Some(handles::LOOP_END.to_string()),
                    target_handle: None,
                },
            ],
            loops: HashMap::from([(def.id.clone(), def.clone())]),
            parallels: HashMap::new(),
        }
    }

    fn for_each_def(items: serde_json::Value) -> LoopDef {
        LoopDef {
            id: "loop-1".to_string(),
            nodes: vec!["inner".to_string()],
            iterations: 99,
            loop_type: LoopType::ForEach,
            for_each_items: Some(items),
            condition: None,
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", TriggerType::Manual, serde_json::Value::Null)
    }

    #[test]
    fn for_each_over_object_yields_key_value_pairs() {
        let def = for_each_def(json!({"k1": "v1", "k2": "v2"}));
        let workflow = loop_workflow(&def);
        let mut ctx = ctx();

        let first = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(!first.completed);
        assert_eq!(first.activate, vec!["inner".to_string()]);
        assert_eq!(ctx.loop_items["loop-1"], json!(["k1", "v1"]));

        ctx.record_output("inner", BlockOutput::Value(json!("one")));
        let second = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(!second.completed);
        assert_eq!(ctx.loop_items["loop-1"], json!(["k2", "v2"]));

        ctx.record_output("inner", BlockOutput::Value(json!("two")));
        let third = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(third.completed);
        assert_eq!(third.activate, vec!["after".to_string()]);
        match third.output {
            BlockOutput::Loop(tick) => {
                assert_eq!(tick.max_iterations, 2);
                assert!(tick.completed);
            }
            other => panic!("expected loop tick, got {other:?}"),
        }
        assert_eq!(
            ctx.loop_results["loop-1"],
            vec![json!("one"), json!("two")]
        );
    }

    #[test]
    fn for_each_max_comes_from_collection_not_iterations() {
        let def = for_each_def(json!(["a", "b", "c"]));
        let workflow = loop_workflow(&def);
        let mut ctx = ctx();
        LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert_eq!(ctx.loop_max_iterations["loop-1"], 3);
    }

    #[test]
    fn missing_collection_is_an_error() {
        let mut def = for_each_def(json!([]));
        def.for_each_items = None;
        let workflow = loop_workflow(&def);
        let err = LoopManager::tick(&workflow, &def, &mut ctx()).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::ForEachMissingCollection { .. }
        ));
    }

    #[test]
    fn empty_collection_is_an_error() {
        let def = for_each_def(json!([]));
        let workflow = loop_workflow(&def);
        let err = LoopManager::tick(&workflow, &def, &mut ctx()).unwrap_err();
        assert!(matches!(err, ExecutionError::ForEachEmpty { .. }));
    }

    #[test]
    fn inner_state_resets_between_iterations() {
        let def = for_each_def(json!(["a", "b"]));
        let workflow = loop_workflow(&def);
        let mut ctx = ctx();

        LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        ctx.record_output("inner", BlockOutput::Value(json!("stale")));
        ctx.decisions
            .router
            .insert("inner".to_string(), "x".to_string());

        LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(ctx.state_of("inner").is_none());
        assert!(!ctx.is_executed("inner"));
        assert!(ctx.decisions.router.get("inner").is_none());
    }

    #[test]
    fn while_loop_stops_when_predicate_fails() {
        let def = LoopDef {
            id: "loop-1".to_string(),
            nodes: vec!["inner".to_string()],
            iterations: 10,
            loop_type: LoopType::While,
            for_each_items: None,
            condition: Some("{{loop.loop-1.index}} < 1".to_string()),
        };
        let workflow = loop_workflow(&def);
        let mut ctx = ctx();

        // The predicate sees the previous iteration's index, so two
        // ticks advance and the third completes.
        let first = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(!first.completed);
        ctx.record_output("inner", BlockOutput::Value(json!(0)));

        let second = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(!second.completed);
        ctx.record_output("inner", BlockOutput::Value(json!(1)));

        let third = LoopManager::tick(&workflow, &def, &mut ctx).unwrap();
        assert!(third.completed);
    }
}
