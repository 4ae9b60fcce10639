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

use anyhow::Result;
use loom::workflow::{BlockConfig, ParamType};
use loom::{
    Block, BlockKind, BlockOutput, Connection, ExecutionError, Executor, ExecutorServices,
    RunOptions, SerializedWorkflow,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_workflow(url: &str, extra_params: Vec<(&str, serde_json::Value)>) -> SerializedWorkflow {
    let starter = Block {
        id: "start".to_string(),
        kind: BlockKind::Starter,
        name: "start".to_string(),
        position: None,
        config: BlockConfig::default(),
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        enabled: true,
    };

    let mut api = starter.clone();
    api.id = "fetch".to_string();
    api.name = "fetch".to_string();
    api.kind = BlockKind::Api;
    api.config.tool = "http_request".to_string();
    api.config.params.insert("url".to_string(), json!(url));
    api.inputs.insert("url".to_string(), ParamType::String);
    api.inputs.insert("body".to_string(), ParamType::Json);
    for (name, value) in extra_params {
        api.config.params.insert(name.to_string(), value);
    }

    SerializedWorkflow {
        version: "1.0".to_string(),
        blocks: BTreeMap::from([
            ("start".to_string(), starter),
            ("fetch".to_string(), api),
        ]),
        connections: vec![Connection {
            source: "start".to_string(),
            target: "fetch".to_string(),
            source_handle: None,
            target_handle: None,
        }],
        loops: HashMap::new(),
        parallels: HashMap::new(),
    }
}

async fn run(wf: SerializedWorkflow) -> Result<loom::ExecutionOutcome, ExecutionError> {
    let executor = Executor::new(Arc::new(wf), Arc::new(ExecutorServices::new()));
    executor.execute(RunOptions::default()).await
}

#[tokio::test]
async fn get_requests_return_parsed_json() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .mount(&server)
        .await;

    let wf = api_workflow(
        &format!("{}/data", server.uri()),
        vec![("params", json!({"page": 2}))],
    );
    let outcome = run(wf).await?;

    let output = outcome
        .context
        .state_of("fetch")
        .map(BlockOutput::as_value)
        .unwrap();
    assert_eq!(output["status"], json!(200));
    assert_eq!(output["data"], json!({"items": [1, 2]}));
    Ok(())
}

#[tokio::test]
async fn string_json_bodies_are_pre_parsed_before_dispatch() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(body_json(json!({"name": "alice"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let wf = api_workflow(
        &format!("{}/submit", server.uri()),
        vec![
            ("method", json!("POST")),
            ("body", json!(" {\"name\": \"alice\"} ")),
        ],
    );
    let outcome = run(wf).await?;

    let output = outcome
        .context
        .state_of("fetch")
        .map(BlockOutput::as_value)
        .unwrap();
    assert_eq!(output["status"], json!(201));
    Ok(())
}

#[tokio::test]
async fn request_headers_are_forwarded() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .and(header("x-api-key", "secret-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let wf = api_workflow(
        &format!("{}/secure", server.uri()),
        vec![("headers", json!({"x-api-key": "secret-1"}))],
    );
    let outcome = run(wf).await?;
    let output = outcome
        .context
        .state_of("fetch")
        .map(BlockOutput::as_value)
        .unwrap();
    assert_eq!(output["status"], json!(200));
    Ok(())
}

#[tokio::test]
async fn http_404_composes_a_suggestion() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/missing", server.uri());
    let err = run(api_workflow(&url, vec![])).await.unwrap_err();

    match err.root() {
        ExecutionError::Provider {
            message,
            status,
            details,
            ..
        } => {
            assert_eq!(*status, Some(404));
            assert!(message.contains(&url));
            assert!(message.contains("GET"));
            assert!(message.contains("404"));
            assert!(message.contains("not found"));
            let details = details.as_ref().unwrap();
            assert_eq!(details["blockId"], json!("fetch"));
            assert_eq!(details["request"]["method"], json!("GET"));
            assert!(details["timestamp"].is_string());
        }
        other => panic!("expected provider error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn http_429_suggests_backing_off() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = run(api_workflow(&format!("{}/limited", server.uri()), vec![]))
        .await
        .unwrap_err();
    match err.root() {
        ExecutionError::Provider { message, .. } => {
            assert!(message.contains("rate limiting"));
        }
        other => panic!("expected provider error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn network_failure_mentions_the_fetch() -> Result<()> {
    // Nothing listens on this port.
    let err = run(api_workflow("http://127.0.0.1:9", vec![]))
        .await
        .unwrap_err();
    match err.root() {
        ExecutionError::Provider { message, .. } => {
            assert!(message.contains("Failed to fetch"), "got: {message}");
        }
        other => panic!("expected provider error, got {other}"),
    }
    Ok(())
}
