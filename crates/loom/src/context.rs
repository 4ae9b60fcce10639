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

use crate::workflow::{BlockId, BlockKind, SubflowId};
use chrono::{DateTime, Utc};
use fxhash::{FxHashMap, FxHashSet};
use llm_contracts::{Cost, ToolCall, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Api,
    Webhook,
    Schedule,
    Chat,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Api => "api",
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Chat => "chat",
        }
    }

    /// Manual and chat runs originate in the UI; everything else counts
    /// against the API quota.
    pub fn is_api_category(&self) -> bool {
        matches!(
            self,
            TriggerType::Api | TriggerType::Webhook | TriggerType::Schedule
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub content: Value,
    pub model: String,
    pub tokens: Usage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedPath {
    pub block_id: BlockId,
    pub block_type: String,
    pub block_title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterDecision {
    pub prompt: String,
    pub model: String,
    pub tokens: Usage,
    pub selected_path: SelectedPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionDecision {
    pub branch: String,
    pub condition_id: String,
    pub result: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopTick {
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelTick {
    pub aggregated: Vec<Value>,
    pub branch_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum BlockOutput {
    Value(Value),
    Agent(AgentResponse),
    Router(RouterDecision),
    Condition(ConditionDecision),
    Loop(LoopTick),
    Parallel(ParallelTick),
}

impl BlockOutput {
    pub fn null() -> Self {
        BlockOutput::Value(Value::Null)
    }

    /// JSON projection consumed by the resolver and the logs.
    pub fn as_value(&self) -> Value {
        match self {
            BlockOutput::Value(v) => v.clone(),
            BlockOutput::Agent(agent) => json!({
                "content": agent.content,
                "model": agent.model,
                "tokens": agent.tokens,
                "toolCalls": agent.tool_calls,
                "cost": agent.cost,
            }),
            BlockOutput::Router(router) => json!({
                "prompt": router.prompt,
                "model": router.model,
                "tokens": router.tokens,
                "selectedPath": router.selected_path,
            }),
            BlockOutput::Condition(cond) => json!({
                "branch": cond.branch,
                "conditionId": cond.condition_id,
                "result": cond.result,
            }),
            BlockOutput::Loop(tick) => json!({
                "currentIteration": tick.current_iteration,
                "maxIterations": tick.max_iterations,
                "completed": tick.completed,
            }),
            BlockOutput::Parallel(tick) => json!({
                "aggregated": tick.aggregated,
                "branchCount": tick.branch_count,
            }),
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        match self {
            BlockOutput::Agent(agent) => Some(&agent.tokens),
            BlockOutput::Router(router) => Some(&router.tokens),
            _ => None,
        }
    }

    pub fn cost(&self) -> Option<Cost> {
        match self {
            BlockOutput::Agent(agent) => agent.cost,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLog {
    pub block_id: BlockId,
    pub block_name: String,
    pub block_kind: BlockKind,
    /// Set when the entry was produced inside a parallel branch; entries
    /// for the same block id from different branches are distinct
    /// executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_index: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decisions {
    pub router: FxHashMap<BlockId, BlockId>,
    pub condition: FxHashMap<BlockId, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Embedded-workflow id stack, used to refuse cycles.
    #[serde(default)]
    pub workflow_stack: Vec<String>,
}

/// Streaming selection for the current run: which block outputs are
/// forwarded as byte streams, as `<blockId>_<field>` tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    pub enabled: bool,
    #[serde(default)]
    pub selected_outputs: Vec<String>,
}

impl StreamConfig {
    pub fn selects_block(&self, block_id: &str) -> bool {
        let prefix = format!("{block_id}_");
        self.enabled
            && self
                .selected_outputs
                .iter()
                .any(|token| token.starts_with(&prefix))
    }
}

/// Branch-local state while executing inside a parallel subflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelScope {
    pub subflow_id: SubflowId,
    pub index: usize,
    pub item: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub trigger: TriggerType,
    pub initial_input: Value,
    pub block_states: FxHashMap<BlockId, BlockOutput>,
    pub block_logs: Vec<BlockLog>,
    pub environment: HashMap<String, String>,
    pub decisions: Decisions,
    pub loop_iterations: FxHashMap<SubflowId, u32>,
    pub loop_items: FxHashMap<SubflowId, Value>,
    pub loop_max_iterations: FxHashMap<SubflowId, u32>,
    pub loop_collections: FxHashMap<SubflowId, Vec<Value>>,
    pub loop_results: FxHashMap<SubflowId, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_scope: Option<ParallelScope>,
    pub executed_blocks: FxHashSet<BlockId>,
    pub active_execution_path: FxHashSet<BlockId>,
    pub completed_loops: FxHashSet<SubflowId>,
    pub completed_parallels: FxHashSet<SubflowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_output: Option<Value>,
    pub metadata: RunMetadata,
    pub stream_config: StreamConfig,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, trigger: TriggerType, input: Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            trigger,
            initial_input: input,
            block_states: FxHashMap::default(),
            block_logs: Vec::new(),
            environment: HashMap::new(),
            decisions: Decisions::default(),
            loop_iterations: FxHashMap::default(),
            loop_items: FxHashMap::default(),
            loop_max_iterations: FxHashMap::default(),
            loop_collections: FxHashMap::default(),
            loop_results: FxHashMap::default(),
            parallel_scope: None,
            executed_blocks: FxHashSet::default(),
            active_execution_path: FxHashSet::default(),
            completed_loops: FxHashSet::default(),
            completed_parallels: FxHashSet::default(),
            terminal_output: None,
            metadata: RunMetadata {
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: 0,
                workflow_stack: Vec::new(),
            },
            stream_config: StreamConfig::default(),
        }
    }

    pub fn record_output(&mut self, block_id: &str, output: BlockOutput) {
        self.block_states.insert(block_id.to_string(), output);
        self.executed_blocks.insert(block_id.to_string());
    }

    pub fn state_of(&self, block_id: &str) -> Option<&BlockOutput> {
        self.block_states.get(block_id)
    }

    pub fn is_executed(&self, block_id: &str) -> bool {
        self.executed_blocks.contains(block_id)
    }

    pub fn is_active(&self, block_id: &str) -> bool {
        self.active_execution_path.contains(block_id)
    }

    pub fn activate(&mut self, block_id: &str) {
        self.active_execution_path.insert(block_id.to_string());
    }

    pub fn deactivate(&mut self, block_id: &str) {
        self.active_execution_path.remove(block_id);
    }

    /// Reset per-iteration state of the given inner blocks so the next
    /// loop tick sees fresh outputs.
    pub fn reset_inner_blocks(&mut self, nodes: &[BlockId]) {
        for node in nodes {
            self.block_states.remove(node);
            self.executed_blocks.remove(node);
            self.active_execution_path.remove(node);
            self.decisions.router.remove(node);
            self.decisions.condition.remove(node);
        }
    }

    /// Fork a branch-local context for one parallel branch: enclosed node
    /// state only, separate loop scope, branch item/index bound.
    pub fn fork_branch(
        &self,
        subflow_id: &str,
        index: usize,
        item: Value,
        nodes: &[BlockId],
    ) -> ExecutionContext {
        let mut branch = self.clone();
        branch.block_logs = Vec::new();
        branch.active_execution_path = FxHashSet::default();
        branch.terminal_output = None;
        branch.parallel_scope = Some(ParallelScope {
            subflow_id: subflow_id.to_string(),
            index,
            item,
        });
        branch.reset_inner_blocks(nodes);
        for node in nodes {
            branch.loop_iterations.remove(node);
            branch.loop_items.remove(node);
            branch.loop_max_iterations.remove(node);
            branch.loop_collections.remove(node);
            branch.loop_results.remove(node);
            branch.completed_loops.remove(node);
        }
        branch
    }

    /// Merge a finished branch back into the parent under the single
    /// writer: logs, executed set, and decisions taken inside the branch.
    pub fn merge_branch(&mut self, branch: ExecutionContext) {
        self.block_logs.extend(branch.block_logs);
        self.executed_blocks.extend(branch.executed_blocks);
        self.decisions.router.extend(branch.decisions.router);
        self.decisions.condition.extend(branch.decisions.condition);
    }

    pub fn total_usage(&self) -> Usage {
        let mut usage = Usage::default();
        for output in self.block_states.values() {
            if let Some(u) = output.usage() {
                usage.add(u);
            }
        }
        usage
    }

    pub fn total_cost(&self) -> f64 {
        self.block_states
            .values()
            .filter_map(|o| o.cost().map(|c| c.total))
            .sum()
    }
}
