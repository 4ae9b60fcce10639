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

use crate::errors::ExecutionError;
use async_trait::async_trait;
use fxhash::FxHashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(output: Value, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(
        &self,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ExecutionError>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP request tool bound.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpRequestTool::new()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    pub async fn execute(
        &self,
        tool_id: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ExecutionError> {
        let tool = self
            .get(tool_id)
            .ok_or_else(|| ExecutionError::ToolNotFound(tool_id.to_string()))?;
        debug!(tool_id = tool_id, "dispatching tool");
        tool.execute(params, cancel).await
    }
}

/// The built-in HTTP tool behind api blocks. HTTP error statuses come back
/// as unsuccessful responses with status attached; transport failures
/// surface as provider errors.
pub struct HttpRequestTool {
    client: Client,
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestTool {
    pub const ID: &'static str = "http_request";

    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn execute(
        &self,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ExecutionError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::Validation {
                message: "http_request requires a url".to_string(),
                block_id: None,
            })?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|_| {
            ExecutionError::Validation {
                message: format!("invalid HTTP method {method:?}"),
                block_id: None,
            }
        })?;

        let mut request = self.client.request(method.clone(), url);

        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }

        if let Some(query) = params.get("params").and_then(Value::as_object) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect();
            request = request.query(&pairs);
        }

        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(body) => request = request.json(body),
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            result = request.send() => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                return Err(ExecutionError::Provider {
                    message: format!("Failed to fetch: {err}"),
                    model: None,
                    status: err.status().map(|s| s.as_u16()),
                    details: Some(json!({ "url": url, "method": method.as_str() })),
                });
            }
        };

        let status = response.status();
        let status_text = status
            .canonical_reason()
            .unwrap_or("Unknown Status")
            .to_string();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), Value::String(v.to_string())))
            })
            .collect();

        let text = response.text().await.unwrap_or_default();
        let data: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        let output = json!({
            "data": data,
            "status": status.as_u16(),
            "statusText": status_text,
            "headers": headers,
        });

        if status.is_success() {
            Ok(ToolResponse::ok(output))
        } else {
            Ok(ToolResponse::failed(
                output,
                format!("{} {}", status.as_u16(), status_text),
            ))
        }
    }
}
