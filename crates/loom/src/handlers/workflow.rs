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
use crate::context::BlockOutput;
use crate::errors::ExecutionError;
use crate::executor::{Executor, ExecutorServices, RunOptions};
use crate::resolver::ResolvedInputs;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Executes another workflow by id under the same trigger, returning its
/// terminal output. Cycles are refused via the id stack in run metadata.
pub struct WorkflowEmbedHandler {
    services: Arc<ExecutorServices>,
}

impl WorkflowEmbedHandler {
    pub fn new(services: Arc<ExecutorServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl BlockHandler for WorkflowEmbedHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Workflow
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let workflow_id = inputs
            .get_str("workflowId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ExecutionError::Validation {
                message: "workflow block requires a workflowId".to_string(),
                block_id: Some(block.id.clone()),
            })?
            .to_string();

        let mut stack = hctx.ctx.metadata.workflow_stack.clone();
        stack.push(hctx.ctx.workflow_id.clone());
        if stack.iter().any(|id| *id == workflow_id) {
            return Err(ExecutionError::Validation {
                message: format!("workflow {workflow_id} would recurse into itself"),
                block_id: Some(block.id.clone()),
            });
        }

        let child_workflow = self
            .services
            .persistence
            .load_workflow(&workflow_id)
            .await?;

        debug!(block_id = %block.id, child = %workflow_id, "embedding workflow");

        let executor = Executor::new(Arc::new(child_workflow), self.services.clone());
        let input = inputs.get("input").cloned().unwrap_or(Value::Null);
        let options = RunOptions {
            workflow_id: workflow_id.clone(),
            trigger: hctx.ctx.trigger,
            input,
            environment: hctx.ctx.environment.clone(),
            workflow_stack: stack,
            cancel: Some(hctx.cancel.clone()),
            ..RunOptions::default()
        };

        let outcome = executor.execute(options).await?;
        HandlerOutcome::output(BlockOutput::Value(outcome.output))
    }
}
