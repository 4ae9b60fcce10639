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
use crate::context::{AgentResponse, BlockOutput};
use crate::errors::ExecutionError;
use crate::providers::{cost_for_model, ProviderRegistry};
use crate::resolver::ResolvedInputs;
use crate::streaming::byte_channel;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use llm_contracts::{LLMRequest, Message, ToolDefinition, Usage};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Composes messages, selects a provider by model, and forwards the
/// request, streaming or not as configured.
pub struct AgentHandler {
    providers: Arc<ProviderRegistry>,
}

impl AgentHandler {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }

    fn build_request(
        block: &Block,
        inputs: &ResolvedInputs,
    ) -> Result<LLMRequest, ExecutionError> {
        let model = inputs
            .get_str("model")
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ExecutionError::Validation {
                message: "agent block requires a model".to_string(),
                block_id: Some(block.id.clone()),
            })?;

        let mut request = LLMRequest::new(model);
        request.system_prompt = inputs
            .get_str("systemPrompt")
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        if let Some(context) = inputs.get("context") {
            match context {
                Value::String(text) if !text.is_empty() => {
                    request.messages.push(Message::user(text.clone()));
                }
                Value::Array(entries) => {
                    for entry in entries {
                        let role = entry
                            .get("role")
                            .and_then(Value::as_str)
                            .unwrap_or("user");
                        let content = entry
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        request.messages.push(Message {
                            role: role.to_string(),
                            content: content.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        if let Some(prompt) = inputs.get_str("userPrompt").or_else(|| inputs.get_str("prompt"))
        {
            if !prompt.is_empty() {
                request.messages.push(Message::user(prompt));
            }
        }

        if request.messages.is_empty() {
            request.messages.push(Message::user(""));
        }

        if let Some(tools) = inputs.get_array("tools") {
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                request.tools.push(ToolDefinition {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    parameters: tool.get("parameters").cloned().unwrap_or(Value::Null),
                });
            }
        }

        request.generation_config.temperature =
            inputs.get_f64("temperature").map(|t| t as f32);
        request.generation_config.max_tokens = inputs.get_u64("maxTokens").map(|t| t as u32);
        request.response_format = inputs.get("responseFormat").cloned().filter(|v| !v.is_null());
        request.api_key = inputs.get_str("apiKey").map(str::to_string);

        Ok(request)
    }

    /// Structured response formats are parsed back into a value; anything
    /// else stays a string.
    fn shape_content(content: String, structured: bool) -> Value {
        if structured {
            if let Ok(parsed) = serde_json::from_str::<Value>(content.trim()) {
                return parsed;
            }
        }
        Value::String(content)
    }
}

#[async_trait]
impl BlockHandler for AgentHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Agent
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let request = Self::build_request(block, &inputs)?;
        let model = request.model.clone();
        let structured = request.response_format.is_some();
        let provider = self.providers.for_model(&model)?;

        if hctx.ctx.stream_config.selects_block(&block.id) {
            debug!(block_id = %block.id, model = %model, "agent block streaming");
            let mut chunks = provider.execute_streaming(request, hctx.cancel).await?;

            let (tx, rx) = byte_channel();
            tokio::spawn(async move {
                while let Some(chunk) = chunks.recv().await {
                    match chunk {
                        Ok(chunk) => {
                            if chunk.is_final {
                                break;
                            }
                            if tx.send(chunk.content_delta.into_bytes()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });

            let execution = BlockOutput::Agent(AgentResponse {
                content: Value::String(String::new()),
                model,
                tokens: Usage::default(),
                tool_calls: Vec::new(),
                cost: None,
            });
            return Ok(HandlerOutcome::Stream {
                stream: rx,
                execution,
            });
        }

        debug!(block_id = %block.id, model = %model, "agent block request");
        let response = provider
            .execute(request, hctx.cancel)
            .await
            .map_err(|err| match err {
                llm_contracts::LLMError::Cancelled => ExecutionError::Cancelled,
                other => ExecutionError::Provider {
                    message: other.to_string(),
                    model: Some(model.clone()),
                    status: None,
                    details: None,
                },
            })?;

        let cost = response
            .cost
            .or_else(|| cost_for_model(&response.model, &response.usage));

        HandlerOutcome::output(BlockOutput::Agent(AgentResponse {
            content: Self::shape_content(response.content, structured),
            model: response.model,
            tokens: response.usage,
            tool_calls: response.tool_calls,
            cost,
        }))
    }
}
