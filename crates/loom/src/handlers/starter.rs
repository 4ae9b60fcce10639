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
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;

/// Returns the run's initial input unchanged.
pub struct StarterHandler;

#[async_trait]
impl BlockHandler for StarterHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Starter
    }

    async fn execute(
        &self,
        _block: &Block,
        _inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        HandlerOutcome::output(BlockOutput::Value(hctx.ctx.initial_input.clone()))
    }
}
