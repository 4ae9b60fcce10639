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
use loom::workflow::BlockConfig;
use loom::{
    Block, BlockKind, ByteStream, Connection, Executor, ExecutorServices, ProviderRegistry,
    RunOptions, ScriptedProvider, SerializedWorkflow, StreamConfig,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

async fn collect(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

fn streaming_workflow() -> SerializedWorkflow {
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
    let mut agent = starter.clone();
    agent.id = "agent1".to_string();
    agent.name = "agent1".to_string();
    agent.kind = BlockKind::Agent;
    agent.config.params.insert("model".to_string(), json!("gpt-4o"));
    agent
        .config
        .params
        .insert("userPrompt".to_string(), json!("profile please"));

    SerializedWorkflow {
        version: "1.0".to_string(),
        blocks: BTreeMap::from([
            ("start".to_string(), starter),
            ("agent1".to_string(), agent),
        ]),
        connections: vec![Connection {
            source: "start".to_string(),
            target: "agent1".to_string(),
            source_handle: None,
            target_handle: None,
        }],
        loops: HashMap::new(),
        parallels: HashMap::new(),
    }
}

fn executor_for(provider: ScriptedProvider) -> Executor {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider));
    let services = ExecutorServices::new().with_providers(providers);
    Executor::new(Arc::new(streaming_workflow()), Arc::new(services))
}

#[tokio::test]
async fn selected_field_is_extracted_from_the_agent_stream() -> Result<()> {
    let provider = ScriptedProvider::new()
        .fallback(r#"{"username":"alice","age":25}"#)
        .stream_chunk_size(5);
    let executor = executor_for(provider);

    let mut outcome = executor
        .execute(RunOptions {
            stream: StreamConfig {
                enabled: true,
                selected_outputs: vec!["agent1_username".to_string()],
            },
            ..RunOptions::default()
        })
        .await?;

    assert_eq!(outcome.streams.len(), 1);
    let (block_id, stream) = outcome.streams.remove(0);
    assert_eq!(block_id, "agent1");
    assert_eq!(collect(stream).await, b"alice");
    Ok(())
}

#[tokio::test]
async fn multiple_selected_fields_join_with_newline() -> Result<()> {
    let provider = ScriptedProvider::new()
        .fallback(r#"{"username":"alice","age":30}"#)
        .stream_chunk_size(3);
    let executor = executor_for(provider);

    let mut outcome = executor
        .execute(RunOptions {
            stream: StreamConfig {
                enabled: true,
                selected_outputs: vec![
                    "agent1_username".to_string(),
                    "agent1_age".to_string(),
                ],
            },
            ..RunOptions::default()
        })
        .await?;

    let (_, stream) = outcome.streams.remove(0);
    assert_eq!(collect(stream).await, b"alice\n30");
    Ok(())
}

#[tokio::test]
async fn unselected_agents_do_not_stream() -> Result<()> {
    let provider = ScriptedProvider::new().fallback("plain answer");
    let executor = executor_for(provider);

    let outcome = executor
        .execute(RunOptions {
            stream: StreamConfig {
                enabled: true,
                selected_outputs: vec!["other-block_content".to_string()],
            },
            ..RunOptions::default()
        })
        .await?;

    assert!(outcome.streams.is_empty());
    match outcome.context.state_of("agent1") {
        Some(loom::BlockOutput::Agent(agent)) => {
            assert_eq!(agent.content, json!("plain answer"));
        }
        other => panic!("expected agent output, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn streams_pass_through_when_no_selection_tokens_match_fields() -> Result<()> {
    // The block streams but the content never looks structured, so the
    // processor passes it through byte for byte.
    let provider = ScriptedProvider::new()
        .fallback("just prose, no JSON")
        .stream_chunk_size(4);
    let executor = executor_for(provider);

    let mut outcome = executor
        .execute(RunOptions {
            stream: StreamConfig {
                enabled: true,
                selected_outputs: vec!["agent1_anything".to_string()],
            },
            ..RunOptions::default()
        })
        .await?;

    let (_, stream) = outcome.streams.remove(0);
    assert_eq!(collect(stream).await, b"just prose, no JSON");
    Ok(())
}
