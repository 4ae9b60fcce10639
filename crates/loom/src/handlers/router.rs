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
use crate::context::{BlockOutput, RouterDecision, SelectedPath};
use crate::errors::ExecutionError;
use crate::providers::ProviderRegistry;
use crate::resolver::ResolvedInputs;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use llm_contracts::{LLMRequest, Message};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_ROUTER_MODEL: &str = "gpt-4o";

/// Asks a language model to pick one downstream block. The response is
/// matched against candidate ids only, case-insensitively and exactly.
pub struct RouterHandler {
    providers: Arc<ProviderRegistry>,
}

impl RouterHandler {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }

    fn candidate_prompt(block: &Block, hctx: &HandlerContext<'_>) -> String {
        let mut lines = vec![
            "You route a workflow to exactly one downstream block.".to_string(),
            "Respond with the id of the chosen block and nothing else.".to_string(),
            String::new(),
            "Candidates:".to_string(),
        ];
        for conn in hctx.workflow.outgoing(&block.id) {
            let Some(target) = hctx.workflow.block(&conn.target) else {
                continue;
            };
            let description = target
                .param_str("description")
                .unwrap_or_default();
            lines.push(format!(
                "- id: {} | title: {} | description: {}",
                target.id, target.name, description
            ));
            if target.kind == BlockKind::Agent {
                if let Some(system_prompt) = target.param_str("systemPrompt") {
                    lines.push(format!("  system prompt: {system_prompt}"));
                }
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl BlockHandler for RouterHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Router
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let prompt = inputs.get_str("prompt").unwrap_or_default().to_string();
        let model = inputs
            .get_str("model")
            .unwrap_or(DEFAULT_ROUTER_MODEL)
            .to_string();

        let mut request = LLMRequest::new(&model);
        request.system_prompt = Some(Self::candidate_prompt(block, &hctx));
        request.messages.push(Message::user(prompt.clone()));
        request.api_key = inputs.get_str("apiKey").map(str::to_string);

        let provider = self.providers.for_model(&model)?;
        let response = provider.execute(request, hctx.cancel).await?;

        let choice = response.content.trim().to_lowercase();
        let selected = hctx
            .workflow
            .outgoing(&block.id)
            .filter_map(|conn| hctx.workflow.block(&conn.target))
            .find(|target| target.id.to_lowercase() == choice);

        let Some(target) = selected else {
            return Err(ExecutionError::InvalidRoutingDecision {
                block_id: block.id.clone(),
                response: response.content,
            });
        };

        debug!(block_id = %block.id, target = %target.id, "router selected path");

        HandlerOutcome::output(BlockOutput::Router(RouterDecision {
            prompt,
            model: response.model,
            tokens: response.usage,
            selected_path: SelectedPath {
                block_id: target.id.clone(),
                block_type: target.kind.as_str().to_string(),
                block_title: target.name.clone(),
            },
        }))
    }
}
