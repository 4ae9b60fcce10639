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
use crate::tools::ToolRegistry;
use crate::workflow::{Block, BlockKind};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub struct ApiHandler {
    tools: Arc<ToolRegistry>,
}

impl ApiHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    fn suggestion_for_status(status: u16) -> Option<&'static str> {
        match status {
            403 => Some("the server may require CORS headers or authentication"),
            404 => Some("the resource was not found, check the URL path"),
            429 => Some("the server is rate limiting requests, retry later"),
            500..=599 => Some("the server failed internally, retry or contact the API owner"),
            _ => None,
        }
    }

    fn suggestion_for_network(message: &str) -> Option<&'static str> {
        if message.contains("Failed to fetch") || message.contains("CORS") {
            Some("the host may be unreachable or blocking cross-origin requests")
        } else {
            None
        }
    }

    fn compose_error(
        block: &Block,
        tool_id: &str,
        url: &str,
        method: &str,
        status: Option<u16>,
        status_text: Option<&str>,
        base_message: &str,
    ) -> ExecutionError {
        let mut message = format!("HTTP request to {url} ({method}) failed: {base_message}");
        if let Some(status) = status {
            if let Some(text) = status_text {
                message.push_str(&format!(" (status {status} {text})"));
            } else {
                message.push_str(&format!(" (status {status})"));
            }
            if let Some(suggestion) = Self::suggestion_for_status(status) {
                message.push_str(&format!(" - {suggestion}"));
            }
        } else if let Some(suggestion) = Self::suggestion_for_network(base_message) {
            message.push_str(&format!(" - {suggestion}"));
        }

        ExecutionError::Provider {
            message,
            model: None,
            status,
            details: Some(json!({
                "toolId": tool_id,
                "blockId": block.id,
                "blockName": block.name,
                "status": status,
                "request": { "url": url, "method": method },
                "timestamp": Utc::now(),
            })),
        }
    }
}

#[async_trait]
impl BlockHandler for ApiHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Api
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: ResolvedInputs,
        hctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, ExecutionError> {
        let url = inputs.get_str("url").unwrap_or_default().trim().to_string();

        // Empty URL is a graceful no-op.
        if url.is_empty() {
            return HandlerOutcome::output(BlockOutput::Value(json!({
                "data": null,
                "status": 200,
                "headers": {},
            })));
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ExecutionError::Validation {
                message: format!(
                    "URL {url:?} is missing a protocol, try \"https://{url}\""
                ),
                block_id: Some(block.id.clone()),
            });
        }

        let method = inputs
            .get_str("method")
            .unwrap_or("GET")
            .to_uppercase();

        let mut body = inputs.get("body").cloned();
        if let Some(Value::String(raw)) = &body {
            let trimmed = raw.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    body = Some(parsed);
                }
            }
        }
        if body.as_ref().is_some_and(Value::is_null) {
            body = None;
        }

        let mut params = json!({
            "url": url,
            "method": method,
            "headers": inputs.get("headers").cloned().unwrap_or(json!({})),
            "params": inputs.get("params").cloned().unwrap_or(json!({})),
        });
        if let Some(body) = body {
            params["body"] = body;
        }

        let tool_id = if block.config.tool.is_empty() {
            crate::tools::HttpRequestTool::ID
        } else {
            block.config.tool.as_str()
        };

        debug!(block_id = %block.id, url = %url, method = %method, "api block dispatch");

        let response = self
            .tools
            .execute(tool_id, params, hctx.cancel)
            .await
            .map_err(|err| match err {
                ExecutionError::Provider { message, status, .. } => Self::compose_error(
                    block,
                    tool_id,
                    &url,
                    &method,
                    status,
                    None,
                    &message,
                ),
                other => other,
            })?;

        if response.success {
            return HandlerOutcome::output(BlockOutput::Value(response.output));
        }

        let status = response
            .output
            .get("status")
            .and_then(Value::as_u64)
            .map(|s| s as u16);
        let status_text = response
            .output
            .get("statusText")
            .and_then(Value::as_str)
            .map(str::to_string);
        Err(Self::compose_error(
            block,
            tool_id,
            &url,
            &method,
            status,
            status_text.as_deref(),
            response.error.as_deref().unwrap_or("request failed"),
        ))
    }
}
