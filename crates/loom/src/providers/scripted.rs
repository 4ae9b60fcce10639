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

//! Deterministic provider for demos and tests: canned responses matched
//! against the prompt, optionally failing or streaming in fixed chunks.

use super::{ChunkStream, ProviderClient};
use async_trait::async_trait;
use llm_contracts::{
    LLMError, LLMRequest, LLMResult, ProviderResponse, StreamChunk, Usage,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    content: String,
    fail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    rules: Vec<Rule>,
    fallback: Option<String>,
    stream_chunk_size: usize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: None,
            stream_chunk_size: 8,
        }
    }

    /// Respond with `content` whenever the combined prompt contains
    /// `needle`. Rules match in registration order.
    pub fn respond(mut self, needle: impl Into<String>, content: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            content: content.into(),
            fail: None,
        });
        self
    }

    /// Fail with a provider error whenever the prompt contains `needle`.
    pub fn fail_on(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            content: String::new(),
            fail: Some(message.into()),
        });
        self
    }

    pub fn fallback(mut self, content: impl Into<String>) -> Self {
        self.fallback = Some(content.into());
        self
    }

    pub fn stream_chunk_size(mut self, size: usize) -> Self {
        self.stream_chunk_size = size.max(1);
        self
    }

    fn pick(&self, request: &LLMRequest) -> LLMResult<String> {
        let mut haystack = request.system_prompt.clone().unwrap_or_default();
        for message in &request.messages {
            haystack.push('\n');
            haystack.push_str(&message.content);
        }

        for rule in &self.rules {
            if haystack.contains(&rule.needle) {
                if let Some(message) = &rule.fail {
                    return Err(LLMError::Provider(message.clone()));
                }
                return Ok(rule.content.clone());
            }
        }

        self.fallback
            .clone()
            .ok_or_else(|| LLMError::Provider("no scripted response matched".to_string()))
    }

    fn usage_for(content: &str, request: &LLMRequest) -> Usage {
        let prompt_tokens = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u32)
            .sum::<u32>()
            .max(1);
        let completion_tokens = (content.split_whitespace().count() as u32).max(1);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        request: LLMRequest,
        _cancel: &CancellationToken,
    ) -> LLMResult<ProviderResponse> {
        let content = self.pick(&request)?;
        let usage = Self::usage_for(&content, &request);
        Ok(ProviderResponse {
            content: content.clone(),
            model: request.model,
            usage,
            tool_calls: Vec::new(),
            finish_reason: Some("stop".to_string()),
            cost: None,
            raw_response: json!({ "scripted": true, "content": content }),
        })
    }

    async fn execute_streaming(
        &self,
        request: LLMRequest,
        _cancel: &CancellationToken,
    ) -> LLMResult<ChunkStream> {
        let content = self.pick(&request)?;
        let usage = Self::usage_for(&content, &request);
        let request_id = request.id;
        let chunk_size = self.stream_chunk_size;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let chars: Vec<char> = content.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                let delta: String = chunk.iter().collect();
                if tx.send(Ok(StreamChunk::delta(request_id, delta))).is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::final_chunk(request_id, Some(usage))));
        });

        Ok(rx)
    }
}
