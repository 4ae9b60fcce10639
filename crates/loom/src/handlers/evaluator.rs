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
use crate::providers::ProviderRegistry;
use crate::resolver::ResolvedInputs;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use llm_contracts::{LLMRequest, Message};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const DEFAULT_EVALUATOR_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Deserialize)]
struct Metric {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    range: Option<MetricRange>,
}

#[derive(Debug, Clone, Deserialize)]
struct MetricRange {
    min: f64,
    max: f64,
}

/// Scores content against a declared metric set with a language model and
/// returns the structured scores.
pub struct EvaluatorHandler {
    providers: Arc<ProviderRegistry>,
}

impl EvaluatorHandler {
    pub fn new(providers: Arc<ProviderRegistry>) -> Self {
        Self { providers }
    }

    fn system_prompt(metrics: &[Metric]) -> String {
        let mut lines = vec![
            "You are an evaluator. Score the provided content on each metric.".to_string(),
            "Respond with a single JSON object mapping metric name to a numeric score."
                .to_string(),
            String::new(),
            "Metrics:".to_string(),
        ];
        for metric in metrics {
            let range = metric
                .range
                .as_ref()
                .map(|r| format!(" ({} to {})", r.min, r.max))
                .unwrap_or_default();
            lines.push(format!("- {}{}: {}", metric.name, range, metric.description));
        }
        lines.join("\n")
    }

    /// Pull a JSON object out of the model response, accepting fenced or
    /// embedded JSON.
    fn extract_scores(content: &str) -> Value {
        if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
            return value;
        }
        if let Some(start) = content.find('{') {
            let mut balance = 0i32;
            for (offset, ch) in content[start..].char_indices() {
                match ch {
                    '{' => balance += 1,
                    '}' => {
                        balance -= 1;
                        if balance == 0 {
                            let candidate = &content[start..=start + offset];
                            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                                return value;
                            }
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
        json!({})
    }
}

#[async_trait]
impl BlockHandler for EvaluatorHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Evaluator
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let content = inputs.get("content").cloned().unwrap_or(Value::Null);
        let content_text = match &content {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };

        let metrics: Vec<Metric> = serde_json::from_value(
            inputs
                .get("metrics")
                .cloned()
                .unwrap_or(Value::Array(Vec::new())),
        )
        .map_err(|e| ExecutionError::Validation {
            message: format!("malformed metrics: {e}"),
            block_id: Some(block.id.clone()),
        })?;

        if metrics.is_empty() {
            return Err(ExecutionError::Validation {
                message: "evaluator block requires at least one metric".to_string(),
                block_id: Some(block.id.clone()),
            });
        }

        let model = inputs
            .get_str("model")
            .unwrap_or(DEFAULT_EVALUATOR_MODEL)
            .to_string();

        let mut request = LLMRequest::new(&model);
        request.system_prompt = Some(Self::system_prompt(&metrics));
        request
            .messages
            .push(Message::user(format!("Content to evaluate:\n{content_text}")));
        request.api_key = inputs.get_str("apiKey").map(str::to_string);
        request.response_format = Some(json!({ "type": "json_object" }));

        let provider = self.providers.for_model(&model)?;
        let response = provider.execute(request, hctx.cancel).await?;

        let scores = Self::extract_scores(&response.content);
        let mut output = Map::new();
        for metric in &metrics {
            let score = scores.get(&metric.name).cloned().unwrap_or(Value::Null);
            output.insert(metric.name.clone(), score);
        }
        output.insert("model".to_string(), json!(response.model));
        output.insert("tokens".to_string(), json!(response.usage));

        HandlerOutcome::output(BlockOutput::Value(Value::Object(output)))
    }
}
