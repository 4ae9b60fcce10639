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

//! HTTP boundary for the workflow engine: `POST /execute/{workflowId}`
//! with cookie or api-key auth, per-user rate limiting, JSON or
//! event-stream responses, and the §-standard error status mapping.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use loom::streaming::sanitize_for_header;
use loom::{
    ExecutionError, Executor, ExecutorServices, InMemoryPersistence, Plan, ProviderRegistry,
    RateLimiter, RunOptions, StreamConfig, TriggerType,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info};

#[derive(Debug, Clone)]
struct Account {
    user_id: String,
    plan: Plan,
}

struct AppState {
    services: Arc<ExecutorServices>,
    rate_limiter: RateLimiter,
    api_keys: HashMap<String, Account>,
    sessions: HashMap<String, Account>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    #[serde(default)]
    input: Value,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    selected_outputs: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bind = std::env::var("LOOM_BIND").unwrap_or_else(|_| "127.0.0.1:3030".to_string());

    let providers = providers_from_env();
    let persistence = Arc::new(InMemoryPersistence::new());
    let services = Arc::new(
        ExecutorServices::new()
            .with_providers(providers)
            .with_persistence(persistence.clone()),
    );

    if let Ok(dir) = std::env::var("LOOM_WORKFLOWS_DIR") {
        seed_workflows(&persistence, &dir).await?;
    }

    let state = Arc::new(AppState {
        services,
        rate_limiter: RateLimiter::default(),
        api_keys: accounts_from_env("LOOM_API_KEYS"),
        sessions: accounts_from_env("LOOM_SESSIONS"),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/execute/{workflow_id}", post(execute))
        .with_state(state);

    info!(bind = %bind, "loom gateway listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// `NAME=token:user:plan,token2:user2:plan2`
fn accounts_from_env(name: &str) -> HashMap<String, Account> {
    let Ok(raw) = std::env::var(name) else {
        return HashMap::new();
    };
    raw.split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().splitn(3, ':');
            let token = parts.next()?.to_string();
            let user_id = parts.next()?.to_string();
            let plan = match parts.next().unwrap_or("free") {
                "pro" => Plan::Pro,
                "team" => Plan::Team,
                "enterprise" => Plan::Enterprise,
                _ => Plan::Free,
            };
            Some((token, Account { user_id, plan }))
        })
        .collect()
}

/// Load every `<id>.json` serialized workflow in the directory.
async fn seed_workflows(persistence: &InMemoryPersistence, dir: &str) -> anyhow::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        let raw = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str(&raw) {
            Ok(workflow) => {
                persistence.put_workflow(id.clone(), workflow).await;
                info!(workflow_id = %id, "workflow loaded");
            }
            Err(err) => error!(path = %path.display(), error = %err, "skipping workflow"),
        }
    }
    Ok(())
}

fn providers_from_env() -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        providers.register(Arc::new(loom::HttpChatProvider::openai(Some(key))));
    }
    if let Ok(endpoint) = std::env::var("LOOM_CHAT_ENDPOINT") {
        providers.register(Arc::new(loom::HttpChatProvider::new(
            "gateway",
            endpoint,
            std::env::var("LOOM_CHAT_API_KEY").ok(),
        )));
    }
    providers
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": Utc::now() }))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<(Account, TriggerType)> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if let Some(account) = state.api_keys.get(key) {
            return Some((account.clone(), TriggerType::Api));
        }
    }
    let cookies = headers.get(header::COOKIE).and_then(|v| v.to_str().ok())?;
    for cookie in cookies.split(';') {
        if let Some(token) = cookie.trim().strip_prefix("session=") {
            if let Some(account) = state.sessions.get(token) {
                return Some((account.clone(), TriggerType::Manual));
            }
        }
    }
    None
}

fn error_body(error: &str, details: Option<Value>) -> Value {
    match details {
        Some(details) => json!({ "error": error, "details": details }),
        None => json!({ "error": error }),
    }
}

/// §-standard error status mapping.
fn status_for(err: &ExecutionError) -> StatusCode {
    match err.root() {
        ExecutionError::Validation { .. } | ExecutionError::MissingEnvVar { .. } => {
            StatusCode::BAD_REQUEST
        }
        ExecutionError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
        ExecutionError::ConcurrentModification(_) => StatusCode::CONFLICT,
        ExecutionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ExecutionError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ExecutionError) -> Response {
    let status = status_for(err);
    let details = match err.root() {
        ExecutionError::Provider { details, .. } => details.clone(),
        _ => err.block_id().map(|id| json!({ "blockId": id })),
    };
    (status, Json(error_body(&err.to_string(), details))).into_response()
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let Some((account, trigger)) = authenticate(&state, &headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(error_body("authentication required", None)),
        )
            .into_response();
    };

    let decision = state
        .rate_limiter
        .check(&account.user_id, account.plan, trigger, false)
        .await;
    if !decision.allowed {
        let retry_after = decision.retry_after_seconds(Utc::now());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(error_body(
                "rate limit exceeded",
                Some(json!({ "retryAfter": retry_after, "limit": decision.limit })),
            )),
        )
            .into_response();
    }

    let workflow = match state.services.persistence.load_workflow(&workflow_id).await {
        Ok(workflow) => workflow,
        Err(err) => return error_response(&err),
    };
    let environment = state
        .services
        .persistence
        .load_environment_variables(&account.user_id)
        .await
        .unwrap_or_default();

    let executor = Executor::new(Arc::new(workflow), state.services.clone());
    let options = RunOptions {
        workflow_id: workflow_id.clone(),
        trigger,
        input: request.input,
        environment,
        stream: StreamConfig {
            enabled: request.stream,
            selected_outputs: request.selected_outputs,
        },
        ..RunOptions::default()
    };

    let outcome = match executor.execute(options).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(workflow_id = %workflow_id, error = %err, "execution failed");
            return error_response(&err);
        }
    };

    let execution_data = sanitize_for_header(
        &json!({
            "executionId": outcome.record.execution_id,
            "durationMs": outcome.record.total_duration_ms,
            "blockCount": outcome.record.block_count,
            "totalTokens": outcome.record.total_tokens,
        })
        .to_string(),
    );

    if request.stream && !outcome.streams.is_empty() {
        return stream_response(outcome, execution_data);
    }

    (
        StatusCode::OK,
        [("x-execution-data", execution_data)],
        Json(json!({ "output": outcome.output })),
    )
        .into_response()
}

/// Newline-delimited `{chunk, done}` frames over `text/event-stream`.
fn stream_response(outcome: loom::ExecutionOutcome, execution_data: String) -> Response {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Vec<u8>, std::io::Error>>();

    tokio::spawn(async move {
        for (_, mut stream) in outcome.streams {
            while let Some(chunk) = stream.recv().await {
                let frame = json!({
                    "chunk": String::from_utf8_lossy(&chunk),
                    "done": false,
                });
                if tx.send(Ok(format!("{frame}\n").into_bytes())).is_err() {
                    return;
                }
            }
        }
        let _ = tx.send(Ok(format!("{}\n", json!({ "chunk": "", "done": true })).into_bytes()));
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header("x-execution-data", execution_data)
        .body(Body::from_stream(UnboundedReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
