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

use super::{BlockHandler, HandlerContext, HandlerOutcome};
use crate::context::{BlockOutput, ConditionDecision};
use crate::errors::ExecutionError;
use crate::resolver::{expr, Resolver, ResolvedInputs};
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct Branch {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    value: String,
}

/// Evaluates branch expressions in declaration order; the first truthy
/// branch wins, a declared `else` catches the rest.
pub struct ConditionHandler;

impl ConditionHandler {
    /// Branches come from the raw params: expressions are resolved by the
    /// expression grammar itself so string substitutions keep their
    /// quoting.
    fn branches(block: &Block) -> Result<Vec<Branch>, ExecutionError> {
        let raw = block
            .param("conditions")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(raw).map_err(|e| ExecutionError::Validation {
            message: format!("malformed conditions: {e}"),
            block_id: Some(block.id.clone()),
        })
    }

    fn branch_label(branch: &Branch) -> String {
        if branch.title.is_empty() {
            branch.id.clone()
        } else {
            branch.title.clone()
        }
    }
}

#[async_trait]
impl BlockHandler for ConditionHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Condition
    }

    async fn execute(
        &self,
        block: &Block,
        _inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let resolver = Resolver::new(hctx.workflow);
        let branches = Self::branches(block)?;
        let mut else_branch: Option<&Branch> = None;

        for branch in &branches {
            let label = Self::branch_label(branch);
            if label.eq_ignore_ascii_case("else") {
                else_branch = Some(branch);
                continue;
            }
            let value = resolver.resolve_expression(&branch.value, hctx.ctx)?;
            debug!(block_id = %block.id, branch = %label, result = ?value, "condition branch evaluated");
            if expr::truthy(&value) {
                return HandlerOutcome::output(BlockOutput::Condition(ConditionDecision {
                    branch: label,
                    condition_id: branch.id.clone(),
                    result: true,
                }));
            }
        }

        if let Some(branch) = else_branch {
            return HandlerOutcome::output(BlockOutput::Condition(ConditionDecision {
                branch: Self::branch_label(branch),
                condition_id: branch.id.clone(),
                result: false,
            }));
        }

        Err(ExecutionError::ConditionUnsatisfied {
            block_id: block.id.clone(),
        })
    }
}
