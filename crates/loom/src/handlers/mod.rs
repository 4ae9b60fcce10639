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

pub mod agent;
pub mod api;
pub mod condition;
pub mod evaluator;
pub mod function;
pub mod response;
pub mod router;
pub mod starter;
pub mod workflow;

use crate::context::{BlockOutput, ExecutionContext};
use crate::errors::ExecutionError;
use crate::resolver::ResolvedInputs;
use crate::streaming::ByteStream;
use crate::workflow::{Block, BlockKind, SerializedWorkflow};
use async_trait::async_trait;
use fxhash::FxHashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use agent::AgentHandler;
pub use api::ApiHandler;
pub use condition::ConditionHandler;
pub use evaluator::EvaluatorHandler;
pub use function::FunctionHandler;
pub use response::ResponseHandler;
pub use router::RouterHandler;
pub use starter::StarterHandler;
pub use workflow::WorkflowEmbedHandler;

/// Read view a handler gets alongside its resolved inputs. Handlers are
/// stateless; all mutation goes through the executor.
pub struct HandlerContext<'a> {
    pub workflow: &'a SerializedWorkflow,
    pub ctx: &'a ExecutionContext,
    pub cancel: &'a CancellationToken,
}

pub enum HandlerOutcome {
    Output(BlockOutput),
    /// Streaming agent response: the byte stream goes to the caller, the
    /// execution metadata side-channel becomes the block state.
    Stream {
        stream: ByteStream,
        execution: BlockOutput,
    },
}

impl HandlerOutcome {
    pub fn output(output: BlockOutput) -> Result<HandlerOutcome, ExecutionError> {
        Ok(HandlerOutcome::Output(output))
    }
}

#[async_trait]
pub trait BlockHandler: Send + Sync {
    fn can_handle(&self, block: &Block) -> bool;

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError>;
}

/// Handler table keyed by block kind; loop and parallel containers are
/// owned by the subflow managers, not by handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    by_kind: FxHashMap<BlockKind, Arc<dyn BlockHandler>>,
    extra: Vec<Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: BlockKind, handler: Arc<dyn BlockHandler>) {
        self.by_kind.insert(kind, handler);
    }

    /// Handlers consulted via `can_handle` when no kind entry matches.
    pub fn register_fallback(&mut self, handler: Arc<dyn BlockHandler>) {
        self.extra.push(handler);
    }

    pub fn find(&self, block: &Block) -> Option<Arc<dyn BlockHandler>> {
        if let Some(handler) = self.by_kind.get(&block.kind) {
            if handler.can_handle(block) {
                return Some(handler.clone());
            }
        }
        self.extra
            .iter()
            .find(|handler| handler.can_handle(block))
            .cloned()
    }
}
