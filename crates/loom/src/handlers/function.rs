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
use crate::resolver::ResolvedInputs;
use crate::sandbox::Sandbox;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Runs untrusted code in the configured sandbox; sandbox errors surface
/// verbatim.
pub struct FunctionHandler {
    sandbox: Arc<dyn Sandbox>,
}

impl FunctionHandler {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl BlockHandler for FunctionHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Function
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let code = inputs
            .get_str("code")
            .ok_or_else(|| ExecutionError::Validation {
                message: "function block requires code".to_string(),
                block_id: Some(block.id.clone()),
            })?
            .to_string();

        let input = inputs
            .get("input")
            .cloned()
            .unwrap_or_else(|| inputs.to_value());
        let timeout = inputs.get_u64("timeout").map(Duration::from_secs);

        let result = self
            .sandbox
            .run(&code, input, timeout, hctx.cancel)
            .await
            .map_err(ExecutionError::Sandbox)?;

        HandlerOutcome::output(BlockOutput::Value(result))
    }
}
