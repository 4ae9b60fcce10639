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

pub mod scripted;

use async_trait::async_trait;
use futures::StreamExt;
use llm_contracts::{
    Cost, CostPerMillionTokens, LLMError, LLMRequest, LLMResult, ProviderResponse, StreamChunk,
    ToolCall, Usage,
};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use scripted::ScriptedProvider;

pub type ChunkStream = mpsc::UnboundedReceiver<LLMResult<StreamChunk>>;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: LLMRequest,
        cancel: &CancellationToken,
    ) -> LLMResult<ProviderResponse>;

    async fn execute_streaming(
        &self,
        request: LLMRequest,
        cancel: &CancellationToken,
    ) -> LLMResult<ChunkStream>;
}

/// Routes a model name to the provider that serves it. Prefix rules first,
/// then the default provider.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    prefix_rules: Vec<(String, String)>,
    default_provider: Option<String>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            prefix_rules: vec![
                ("gpt-".to_string(), "openai".to_string()),
                ("o1".to_string(), "openai".to_string()),
                ("o3".to_string(), "openai".to_string()),
                ("claude-".to_string(), "anthropic".to_string()),
                ("llama".to_string(), "ollama".to_string()),
                ("mistral".to_string(), "ollama".to_string()),
            ],
            default_provider: None,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ProviderClient>) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_provider = Some(name.into());
    }

    pub fn for_model(&self, model: &str) -> LLMResult<Arc<dyn ProviderClient>> {
        let lowered = model.to_lowercase();
        let by_prefix = self
            .prefix_rules
            .iter()
            .find(|(prefix, _)| lowered.starts_with(prefix))
            .map(|(_, provider)| provider.clone());

        let name = by_prefix
            .filter(|name| self.providers.contains_key(name))
            .or_else(|| self.default_provider.clone())
            .ok_or_else(|| LLMError::ModelNotFound(model.to_string()))?;

        self.providers
            .get(&name)
            .cloned()
            .ok_or_else(|| LLMError::ModelNotFound(model.to_string()))
    }
}

static MODEL_COSTS: Lazy<HashMap<&'static str, CostPerMillionTokens>> = Lazy::new(|| {
    HashMap::from([
        (
            "gpt-4o",
            CostPerMillionTokens {
                input: 2.5,
                output: 10.0,
            },
        ),
        (
            "gpt-4o-mini",
            CostPerMillionTokens {
                input: 0.15,
                output: 0.6,
            },
        ),
        (
            "claude-sonnet-4",
            CostPerMillionTokens {
                input: 3.0,
                output: 15.0,
            },
        ),
        (
            "claude-haiku-3.5",
            CostPerMillionTokens {
                input: 0.8,
                output: 4.0,
            },
        ),
    ])
});

/// Price an exchange from the static table; unknown models have no cost.
pub fn cost_for_model(model: &str, usage: &Usage) -> Option<Cost> {
    let rates = MODEL_COSTS.get(model)?;
    let (input, output) = rates.cost_for(usage.prompt_tokens, usage.completion_tokens);
    Some(Cost {
        input,
        output,
        total: input + output,
    })
}

/// OpenAI-compatible chat completions client. Covers OpenAI itself plus
/// every gateway speaking the same wire format.
#[derive(Clone)]
pub struct HttpChatProvider {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpChatProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn openai(api_key: Option<String>) -> Self {
        Self::new(
            "openai",
            "https://api.openai.com/v1/chat/completions",
            api_key,
        )
    }

    fn build_payload(&self, request: &LLMRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            messages.push(json!({ "role": message.role, "content": message.content }));
        }

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.generation_config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.generation_config.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.generation_config.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.generation_config.stop_sequences {
            payload["stop"] = json!(stop);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect::<Vec<_>>());
        }
        if let Some(format) = &request.response_format {
            payload["response_format"] = format.clone();
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    fn auth_key<'a>(&'a self, request: &'a LLMRequest) -> Option<&'a str> {
        request.api_key.as_deref().or(self.api_key.as_deref())
    }

    fn parse_response(&self, data: Value, model: String) -> LLMResult<ProviderResponse> {
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let tool_calls: Vec<ToolCall> = data["choices"][0]["message"]["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let name = call["function"]["name"].as_str()?;
                        let arguments = call["function"]["arguments"]
                            .as_str()
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCall {
                            id: call["id"].as_str().unwrap_or_default().to_string(),
                            name: name.to_string(),
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if content.is_empty() && tool_calls.is_empty() {
            return Err(LLMError::Provider(
                "no content in provider response".to_string(),
            ));
        }

        let usage = data.get("usage").map_or_else(Usage::default, |usage| Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
        });

        let finish_reason = data["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);
        let cost = cost_for_model(&model, &usage);

        Ok(ProviderResponse {
            content,
            model,
            usage,
            tool_calls,
            finish_reason,
            cost,
            raw_response: data,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        request: LLMRequest,
        cancel: &CancellationToken,
    ) -> LLMResult<ProviderResponse> {
        let payload = self.build_payload(&request, false);
        let mut http = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(key) = self.auth_key(&request) {
            http = http.header("Authorization", format!("Bearer {key}"));
        }

        debug!(model = %request.model, endpoint = %self.endpoint, "provider request");

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(LLMError::Cancelled),
            result = http.send() => result.map_err(|e| LLMError::Network(e.to_string()))?,
        };

        let status = response.status();
        let data: Value = response
            .json()
            .await
            .map_err(|e| LLMError::Serialisation(e.to_string()))?;

        if !status.is_success() {
            let message = data["error"]["message"]
                .as_str()
                .unwrap_or("provider request failed")
                .to_string();
            return Err(match status.as_u16() {
                401 | 403 => LLMError::Authentication(message),
                429 => LLMError::RateLimit,
                _ => LLMError::Provider(format!("{status}: {message}")),
            });
        }

        self.parse_response(data, request.model)
    }

    async fn execute_streaming(
        &self,
        request: LLMRequest,
        cancel: &CancellationToken,
    ) -> LLMResult<ChunkStream> {
        let payload = self.build_payload(&request, true);
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let auth = self.auth_key(&request).map(str::to_string);
        let request_id = request.id;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut http = client
                .post(&endpoint)
                .header("content-type", "application/json")
                .json(&payload);
            if let Some(key) = auth {
                http = http.header("Authorization", format!("Bearer {key}"));
            }

            let response = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tx.send(Err(LLMError::Cancelled));
                    return;
                }
                result = http.send() => result,
            };

            let response = match response {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let _ = tx.send(Err(LLMError::Provider(format!(
                        "streaming request failed: {}",
                        response.status()
                    ))));
                    return;
                }
                Err(err) => {
                    let _ = tx.send(Err(LLMError::Network(err.to_string())));
                    return;
                }
            };

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let Ok(bytes) = chunk else {
                    warn!("provider stream interrupted");
                    break;
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer.split_off(line_end + 1);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(StreamChunk::final_chunk(request_id, None)));
                        return;
                    }
                    if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                        if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str() {
                            let _ = tx.send(Ok(StreamChunk::delta(request_id, delta)));
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
