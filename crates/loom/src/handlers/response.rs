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
use serde_json::Value;

/// Marks the workflow as terminating with the provided value. The
/// executor stops following outgoing edges once a response block ran.
pub struct ResponseHandler;

#[async_trait]
impl BlockHandler for ResponseHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Response
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: ResolvedInputs,
        _hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let value = inputs
            .get("data")
            .cloned()
            .unwrap_or_else(|| inputs.to_value());
        let value = if value.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            value
        };
        HandlerOutcome::output(BlockOutput::Value(value))
    }
}
