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
use loom::workflow::{handles, BlockConfig, ParamType};
use loom::{
    Block, BlockKind, BlockOutput, Connection, ExecutionError, Executor, ExecutorServices,
    InMemoryPersistence, LoopDef, LoopType, ParallelDef, ParallelType, ProviderRegistry,
    RunOptions, ScriptedProvider, SerializedWorkflow,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn block(id: &str, kind: BlockKind) -> Block {
    Block {
        id: id.to_string(),
        kind,
        name: id.to_string(),
        position: None,
        config: BlockConfig::default(),
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        enabled: true,
    }
}

fn agent_block(id: &str, prompt: &str) -> Block {
    let mut b = block(id, BlockKind::Agent);
    b.config.params.insert("model".to_string(), json!("gpt-4o"));
    b.config
        .params
        .insert("userPrompt".to_string(), json!(prompt));
    b
}

fn conn(source: &str, target: &str) -> Connection {
    Connection {
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
        target_handle: None,
    }
}

fn handle_conn(source: &str, target: &str, handle: &str) -> Connection {
    Connection {
        source: source.to_string(),
        target: target.to_string(),
        source_handle: Some(handle.to_string()),
        target_handle: None,
    }
}

fn workflow(
    blocks: Vec<Block>,
    connections: Vec<Connection>,
    loops: Vec<LoopDef>,
    parallels: Vec<ParallelDef>,
) -> SerializedWorkflow {
    SerializedWorkflow {
        version: "1.0".to_string(),
        blocks: blocks
            .into_iter()
            .map(|b| (b.id.clone(), b))
            .collect::<BTreeMap<_, _>>(),
        connections,
        loops: loops.into_iter().map(|l| (l.id.clone(), l)).collect(),
        parallels: parallels.into_iter().map(|p| (p.id.clone(), p)).collect(),
    }
}

fn executor_with(provider: ScriptedProvider, wf: SerializedWorkflow) -> Executor {
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider));
    let services = ExecutorServices::new().with_providers(providers);
    Executor::new(Arc::new(wf), Arc::new(services))
}

#[tokio::test]
async fn straight_line_starter_to_agent() -> Result<()> {
    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            agent_block("writer", "Write about {{start.topic}}"),
        ],
        vec![conn("start", "writer")],
        vec![],
        vec![],
    );

    let provider = ScriptedProvider::new().fallback("A short note about AI.");
    let executor = executor_with(provider, wf);
    let outcome = executor
        .execute(RunOptions {
            input: json!({"topic": "AI"}),
            ..RunOptions::default()
        })
        .await?;

    match outcome.context.state_of("writer") {
        Some(BlockOutput::Agent(agent)) => {
            assert_eq!(agent.content, json!("A short note about AI."));
            assert_eq!(
                agent.tokens.total_tokens,
                agent.tokens.prompt_tokens + agent.tokens.completion_tokens
            );
        }
        other => panic!("expected agent output, got {other:?}"),
    }

    let completions: Vec<_> = outcome
        .context
        .block_logs
        .iter()
        .filter(|l| l.success)
        .collect();
    assert_eq!(completions.len(), 2);
    assert_eq!(outcome.record.block_count, 2);
    assert_eq!(outcome.record.error_count, 0);
    Ok(())
}

#[tokio::test]
async fn router_activates_only_the_selected_path() -> Result<()> {
    let mut router = block("router", BlockKind::Router);
    router
        .config
        .params
        .insert("prompt".to_string(), json!("pick a branch"));
    router
        .config
        .params
        .insert("model".to_string(), json!("gpt-4o"));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            router,
            agent_block("a", "branch a"),
            agent_block("b", "branch b"),
            agent_block("c", "branch c"),
        ],
        vec![
            conn("start", "router"),
            conn("router", "a"),
            conn("router", "b"),
            conn("router", "c"),
        ],
        vec![],
        vec![],
    );

    let provider = ScriptedProvider::new()
        .respond("pick a branch", "b")
        .fallback("done");
    let executor = executor_with(provider, wf);
    let outcome = executor.execute(RunOptions::default()).await?;

    assert_eq!(
        outcome.context.decisions.router.get("router"),
        Some(&"b".to_string())
    );
    assert!(outcome.context.is_executed("b"));
    assert!(!outcome.context.is_executed("a"));
    assert!(!outcome.context.is_executed("c"));
    assert!(outcome.context.active_execution_path.is_empty());
    assert!(!outcome
        .context
        .block_logs
        .iter()
        .any(|l| l.block_id == "a" || l.block_id == "c"));
    Ok(())
}

#[tokio::test]
async fn router_with_unmatched_response_fails() -> Result<()> {
    let mut router = block("router", BlockKind::Router);
    router
        .config
        .params
        .insert("prompt".to_string(), json!("pick a branch"));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            router,
            agent_block("a", "branch a"),
        ],
        vec![conn("start", "router"), conn("router", "a")],
        vec![],
        vec![],
    );

    let provider = ScriptedProvider::new().fallback("no such block");
    let executor = executor_with(provider, wf);
    let err = executor.execute(RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        ExecutionError::InvalidRoutingDecision { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn for_each_loop_over_object_iterates_entries() -> Result<()> {
    let mut echo = block("echo", BlockKind::Function);
    echo.config
        .params
        .insert("code".to_string(), json!("input"));
    echo.config
        .params
        .insert("input".to_string(), json!("{{loop.loop-1.item}}"));
    echo.inputs.insert("input".to_string(), ParamType::Any);

    let mut after = block("after", BlockKind::Function);
    after
        .config
        .params
        .insert("code".to_string(), json!("input"));
    after
        .config
        .params
        .insert("input".to_string(), json!("{{loop.loop-1.results}}"));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            block("loop-1", BlockKind::Loop),
            echo,
            after,
        ],
        vec![
            conn("start", "loop-1"),
            handle_conn("loop-1", "echo", handles::LOOP_START),
            handle_conn("loop-1", "after", handles::LOOP_END),
        ],
        vec![LoopDef {
            id: "loop-1".to_string(),
            nodes: vec!["echo".to_string()],
            iterations: 50,
            loop_type: LoopType::ForEach,
            for_each_items: Some(json!({"k1": "v1", "k2": "v2"})),
            condition: None,
        }],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), wf);
    let outcome = executor.execute(RunOptions::default()).await?;

    // Two advancing ticks plus the completing one.
    let loop_logs: Vec<_> = outcome
        .context
        .block_logs
        .iter()
        .filter(|l| l.block_id == "loop-1")
        .collect();
    assert_eq!(loop_logs.len(), 3);
    let last_tick = loop_logs.last().unwrap().output.clone().unwrap();
    assert_eq!(last_tick["completed"], json!(true));
    assert_eq!(last_tick["maxIterations"], json!(2));

    assert_eq!(
        outcome.context.loop_results["loop-1"],
        vec![json!(["k1", "v1"]), json!(["k2", "v2"])]
    );
    assert_eq!(
        outcome.context.state_of("after").map(BlockOutput::as_value),
        Some(json!([["k1", "v1"], ["k2", "v2"]]))
    );
    Ok(())
}

#[tokio::test]
async fn parallel_branch_failure_surfaces_an_aggregate() -> Result<()> {
    let worker = agent_block("worker", "task {{parallel.par-1.index}}");

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            block("par-1", BlockKind::Parallel),
            worker,
            block("after", BlockKind::Response),
        ],
        vec![
            conn("start", "par-1"),
            handle_conn("par-1", "worker", handles::PARALLEL_START),
            handle_conn("par-1", "after", handles::PARALLEL_END),
        ],
        vec![],
        vec![ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["worker".to_string()],
            parallel_type: ParallelType::Count,
            count: Some(3),
            distribution: None,
        }],
    );

    let provider = ScriptedProvider::new()
        .fail_on("task 1", "upstream model exploded")
        .fallback("branch done");

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(provider));
    let persistence = Arc::new(InMemoryPersistence::new());
    let services = ExecutorServices::new()
        .with_providers(providers)
        .with_persistence(persistence.clone());
    let executor = Executor::new(Arc::new(wf), Arc::new(services));

    let err = executor.execute(RunOptions::default()).await.unwrap_err();

    match err.root() {
        ExecutionError::Aggregate { errors } => {
            assert_eq!(errors.len(), 1);
            assert!(matches!(errors[0].root(), ExecutionError::Provider { .. }));
        }
        other => panic!("expected aggregate, got {other}"),
    }

    // The two healthy branches still recorded their outputs in the logs.
    let records = persistence.saved_logs().await;
    assert_eq!(records.len(), 1);
    let worker_successes = records[0]
        .trace_spans
        .iter()
        .filter(|span| span.block_id == "worker" && span.status == "success")
        .count();
    assert_eq!(worker_successes, 2);
    let worker_failures = records[0]
        .trace_spans
        .iter()
        .filter(|span| span.block_id == "worker" && span.status == "error")
        .count();
    assert_eq!(worker_failures, 1);
    Ok(())
}

#[tokio::test]
async fn parallel_collection_aggregates_in_branch_order() -> Result<()> {
    let mut echo = block("echo", BlockKind::Function);
    echo.config
        .params
        .insert("code".to_string(), json!("input"));
    echo.config
        .params
        .insert("input".to_string(), json!("{{parallel.par-1.item}}"));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            block("par-1", BlockKind::Parallel),
            echo,
        ],
        vec![
            conn("start", "par-1"),
            handle_conn("par-1", "echo", handles::PARALLEL_START),
        ],
        vec![],
        vec![ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["echo".to_string()],
            parallel_type: ParallelType::Collection,
            count: None,
            distribution: Some(json!(["x", "y", "z"])),
        }],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), wf);
    let outcome = executor.execute(RunOptions::default()).await?;

    match outcome.context.state_of("par-1") {
        Some(BlockOutput::Parallel(tick)) => {
            assert_eq!(tick.branch_count, 3);
            assert_eq!(tick.aggregated, vec![json!("x"), json!("y"), json!("z")]);
        }
        other => panic!("expected parallel output, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn zero_branch_parallel_completes_with_empty_aggregate() -> Result<()> {
    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            block("par-1", BlockKind::Parallel),
            block("echo", BlockKind::Function),
            block("after", BlockKind::Function),
        ],
        vec![
            conn("start", "par-1"),
            handle_conn("par-1", "echo", handles::PARALLEL_START),
            handle_conn("par-1", "after", handles::PARALLEL_END),
        ],
        vec![],
        vec![ParallelDef {
            id: "par-1".to_string(),
            nodes: vec!["echo".to_string()],
            parallel_type: ParallelType::Count,
            count: Some(0),
            distribution: None,
        }],
    );

    let mut after_code = wf.clone();
    let after = after_code.blocks.get_mut("after").unwrap();
    after.config.params.insert("code".to_string(), json!("true"));

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), after_code);
    let outcome = executor.execute(RunOptions::default()).await?;

    match outcome.context.state_of("par-1") {
        Some(BlockOutput::Parallel(tick)) => {
            assert_eq!(tick.branch_count, 0);
            assert!(tick.aggregated.is_empty());
        }
        other => panic!("expected parallel output, got {other:?}"),
    }
    assert!(outcome.context.is_executed("after"));
    assert!(!outcome.context.is_executed("echo"));
    Ok(())
}

#[tokio::test]
async fn api_url_without_protocol_fails_validation() -> Result<()> {
    let mut api = block("fetch", BlockKind::Api);
    api.config.tool = "http_request".to_string();
    api.config
        .params
        .insert("url".to_string(), json!("example.com/api"));
    api.inputs.insert("url".to_string(), ParamType::String);

    let wf = workflow(
        vec![block("start", BlockKind::Starter), api],
        vec![conn("start", "fetch")],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), wf);
    let err = executor.execute(RunOptions::default()).await.unwrap_err();

    match err.root() {
        ExecutionError::Validation { message, .. } => {
            assert!(
                message.contains("try \"https://example.com/api\""),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected validation error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn api_block_with_empty_url_is_a_graceful_no_op() -> Result<()> {
    let mut api = block("fetch", BlockKind::Api);
    api.config
        .params
        .insert("url".to_string(), json!(""));

    let wf = workflow(
        vec![block("start", BlockKind::Starter), api],
        vec![conn("start", "fetch")],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), wf);
    let outcome = executor.execute(RunOptions::default()).await?;
    assert_eq!(
        outcome.context.state_of("fetch").map(BlockOutput::as_value),
        Some(json!({"data": null, "status": 200, "headers": {}}))
    );
    Ok(())
}

#[tokio::test]
async fn condition_takes_the_first_truthy_branch() -> Result<()> {
    let mut cond = block("cond", BlockKind::Condition);
    cond.config.params.insert(
        "conditions".to_string(),
        json!([
            {"id": "c1", "title": "if", "value": "{{start.score}} >= 50"},
            {"id": "c2", "title": "else", "value": ""},
        ]),
    );

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            cond,
            agent_block("high", "high path"),
            agent_block("low", "low path"),
        ],
        vec![
            conn("start", "cond"),
            handle_conn("cond", "high", "condition-cond-if"),
            handle_conn("cond", "low", "condition-cond-else"),
        ],
        vec![],
        vec![],
    );

    let provider = ScriptedProvider::new().fallback("done");
    let executor = executor_with(provider, wf);
    let outcome = executor
        .execute(RunOptions {
            input: json!({"score": 80}),
            ..RunOptions::default()
        })
        .await?;

    assert_eq!(
        outcome.context.decisions.condition.get("cond"),
        Some(&"if".to_string())
    );
    assert!(outcome.context.is_executed("high"));
    assert!(!outcome.context.is_executed("low"));
    Ok(())
}

#[tokio::test]
async fn condition_without_matching_branch_fails() -> Result<()> {
    let mut cond = block("cond", BlockKind::Condition);
    cond.config.params.insert(
        "conditions".to_string(),
        json!([{"id": "c1", "title": "if", "value": "1 > 2"}]),
    );

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            cond,
            agent_block("high", "high path"),
        ],
        vec![
            conn("start", "cond"),
            handle_conn("cond", "high", "condition-cond-if"),
        ],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("done"), wf);
    let err = executor.execute(RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        ExecutionError::ConditionUnsatisfied { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn disabled_blocks_pass_through_null() -> Result<()> {
    let mut disabled = agent_block("middle", "never runs");
    disabled.enabled = false;

    let mut tail = block("tail", BlockKind::Function);
    tail.config.params.insert("code".to_string(), json!("true"));

    let wf = workflow(
        vec![block("start", BlockKind::Starter), disabled, tail],
        vec![conn("start", "middle"), conn("middle", "tail")],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("done"), wf);
    let outcome = executor.execute(RunOptions::default()).await?;

    assert_eq!(
        outcome.context.state_of("middle").map(BlockOutput::as_value),
        Some(Value::Null)
    );
    assert!(outcome.context.is_executed("tail"));
    assert_eq!(outcome.record.skipped_count, 1);
    Ok(())
}

#[tokio::test]
async fn response_block_terminates_the_run() -> Result<()> {
    let mut response = block("respond", BlockKind::Response);
    response
        .config
        .params
        .insert("data".to_string(), json!({"message": "{{start.topic}}"}));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            response,
            agent_block("never", "should not run"),
        ],
        vec![conn("start", "respond"), conn("respond", "never")],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("done"), wf);
    let outcome = executor
        .execute(RunOptions {
            input: json!({"topic": "hello"}),
            ..RunOptions::default()
        })
        .await?;

    assert_eq!(outcome.output, json!({"message": "hello"}));
    assert!(!outcome.context.is_executed("never"));
    Ok(())
}

#[tokio::test]
async fn embedded_workflows_run_and_cycles_are_refused() -> Result<()> {
    let child = workflow(
        vec![block("start", BlockKind::Starter), {
            let mut r = block("respond", BlockKind::Response);
            r.config
                .params
                .insert("data".to_string(), json!({"child": true}));
            r
        }],
        vec![conn("start", "respond")],
        vec![],
        vec![],
    );

    let mut embed = block("embed", BlockKind::Workflow);
    embed
        .config
        .params
        .insert("workflowId".to_string(), json!("child"));

    let parent = workflow(
        vec![block("start", BlockKind::Starter), embed],
        vec![conn("start", "embed")],
        vec![],
        vec![],
    );

    let persistence = Arc::new(InMemoryPersistence::new());
    persistence.put_workflow("child", child).await;

    let services = ExecutorServices::new().with_persistence(persistence.clone());
    let executor = Executor::new(Arc::new(parent.clone()), Arc::new(services));
    let outcome = executor
        .execute(RunOptions {
            workflow_id: "parent".to_string(),
            ..RunOptions::default()
        })
        .await?;
    assert_eq!(
        outcome.context.state_of("embed").map(BlockOutput::as_value),
        Some(json!({"child": true}))
    );

    // A workflow embedding itself is refused.
    persistence.put_workflow("parent", parent.clone()).await;
    let mut self_embed = parent.clone();
    self_embed
        .blocks
        .get_mut("embed")
        .unwrap()
        .config
        .params
        .insert("workflowId".to_string(), json!("parent"));
    let services = ExecutorServices::new().with_persistence(persistence.clone());
    let executor = Executor::new(Arc::new(self_embed), Arc::new(services));
    let err = executor
        .execute(RunOptions {
            workflow_id: "parent".to_string(),
            ..RunOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err.root(), ExecutionError::Validation { .. }));
    Ok(())
}

#[tokio::test]
async fn cancelled_runs_stop_before_dispatch() -> Result<()> {
    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            agent_block("writer", "anything"),
        ],
        vec![conn("start", "writer")],
        vec![],
        vec![],
    );

    let cancel = loom::CancellationToken::new();
    cancel.cancel();

    let executor = executor_with(ScriptedProvider::new().fallback("done"), wf);
    let err = executor
        .execute(RunOptions {
            cancel: Some(cancel),
            ..RunOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Cancelled));
    Ok(())
}

#[tokio::test]
async fn deadline_expiry_maps_to_deadline_exceeded() -> Result<()> {
    // A while-loop with an always-true predicate spins until the deadline.
    let mut echo = block("echo", BlockKind::Function);
    echo.config.params.insert("code".to_string(), json!("true"));

    let wf = workflow(
        vec![
            block("start", BlockKind::Starter),
            block("loop-1", BlockKind::Loop),
            echo,
        ],
        vec![
            conn("start", "loop-1"),
            handle_conn("loop-1", "echo", handles::LOOP_START),
        ],
        vec![LoopDef {
            id: "loop-1".to_string(),
            nodes: vec!["echo".to_string()],
            iterations: u32::MAX,
            loop_type: LoopType::While,
            for_each_items: None,
            condition: Some("true".to_string()),
        }],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("done"), wf);
    let err = executor
        .execute(RunOptions {
            deadline: Some(std::time::Duration::from_millis(50)),
            ..RunOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::DeadlineExceeded));
    Ok(())
}

#[tokio::test]
async fn unknown_tool_id_fails_with_tool_not_found() -> Result<()> {
    let mut api = block("fetch", BlockKind::Api);
    api.config.tool = "no_such_tool".to_string();
    api.config
        .params
        .insert("url".to_string(), json!("https://example.com"));

    let wf = workflow(
        vec![block("start", BlockKind::Starter), api],
        vec![conn("start", "fetch")],
        vec![],
        vec![],
    );

    let executor = executor_with(ScriptedProvider::new().fallback("unused"), wf);
    let err = executor.execute(RunOptions::default()).await.unwrap_err();
    assert!(matches!(err.root(), ExecutionError::ToolNotFound(_)));
    Ok(())
}
