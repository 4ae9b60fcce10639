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

//! End-to-end demonstration: a workflow with a router, a forEach loop and
//! a parallel fan-out, executed against the scripted provider.

use anyhow::Result;
use loom::workflow::{handles, BlockConfig};
use loom::{
    Block, BlockKind, Connection, Executor, ExecutorServices, LoopDef, LoopType, ParallelDef,
    ParallelType, ProviderRegistry, RunOptions, ScriptedProvider, SerializedWorkflow,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn block(id: &str, kind: BlockKind, params: Vec<(&str, serde_json::Value)>) -> Block {
    let mut config = BlockConfig::default();
    for (name, value) in params {
        config.params.insert(name.to_string(), value);
    }
    Block {
        id: id.to_string(),
        kind,
        name: id.to_string(),
        position: None,
        config,
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        enabled: true,
    }
}

fn conn(source: &str, target: &str, handle: Option<&str>) -> Connection {
    Connection {
        source: source.to_string(),
        target: target.to_string(),
        source_handle: handle.map(str::to_string),
        target_handle: None,
    }
}

fn demo_workflow() -> SerializedWorkflow {
    let blocks = vec![
        block("start", BlockKind::Starter, vec![]),
        block(
            "triage",
            BlockKind::Router,
            vec![
                ("prompt", json!("Route this request: {{start.request}}")),
                ("model", json!("gpt-4o")),
            ],
        ),
        block(
            "summarize",
            BlockKind::Agent,
            vec![
                ("model", json!("gpt-4o")),
                ("userPrompt", json!("Summarize: {{start.request}}")),
                ("description", json!("writes a summary")),
            ],
        ),
        block("batch", BlockKind::Loop, vec![]),
        block(
            "review-item",
            BlockKind::Function,
            vec![
                ("code", json!("input")),
                ("input", json!("{{loop.batch.item}}")),
            ],
        ),
        block("fanout", BlockKind::Parallel, vec![]),
        block(
            "branch-work",
            BlockKind::Agent,
            vec![
                ("model", json!("gpt-4o")),
                (
                    "userPrompt",
                    json!("Handle shard {{parallel.fanout.index}}"),
                ),
            ],
        ),
        block(
            "respond",
            BlockKind::Response,
            vec![(
                "data",
                json!({
                    "reviewed": "{{loop.batch.results}}",
                    "shards": "{{fanout.aggregated}}",
                }),
            )],
        ),
    ];

    SerializedWorkflow {
        version: "1.0".to_string(),
        blocks: blocks
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect::<BTreeMap<_, _>>(),
        connections: vec![
            conn("start", "triage", None),
            conn("triage", "summarize", None),
            conn("triage", "batch", None),
            conn("batch", "review-item", Some(handles::LOOP_START)),
            conn("batch", "fanout", Some(handles::LOOP_END)),
            conn("fanout", "branch-work", Some(handles::PARALLEL_START)),
            conn("fanout", "respond", Some(handles::PARALLEL_END)),
        ],
        loops: HashMap::from([(
            "batch".to_string(),
            LoopDef {
                id: "batch".to_string(),
                nodes: vec!["review-item".to_string()],
                iterations: 10,
                loop_type: LoopType::ForEach,
                for_each_items: Some(json!({"alpha": 1, "beta": 2})),
                condition: None,
            },
        )]),
        parallels: HashMap::from([(
            "fanout".to_string(),
            ParallelDef {
                id: "fanout".to_string(),
                nodes: vec!["branch-work".to_string()],
                parallel_type: ParallelType::Count,
                count: Some(3),
                distribution: None,
            },
        )]),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let provider = ScriptedProvider::new()
        .respond("Route this request", "batch")
        .respond("Handle shard", "shard handled")
        .fallback("done");

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider));
    let services = Arc::new(ExecutorServices::new().with_providers(providers));

    let executor = Executor::new(Arc::new(demo_workflow()), services);
    let outcome = executor
        .execute(RunOptions {
            workflow_id: "demo".to_string(),
            input: json!({"request": "review the batch and fan the shards out"}),
            ..RunOptions::default()
        })
        .await?;

    println!("final output:\n{}", serde_json::to_string_pretty(&outcome.output)?);
    println!(
        "\nexecution record:\n{}",
        serde_json::to_string_pretty(&outcome.record)?
    );
    Ok(())
}
