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

pub mod events;

pub use events::ExecutionEvent;

use crate::context::{BlockLog, BlockOutput, ExecutionContext, StreamConfig, TriggerType};
use crate::errors::ExecutionError;
use crate::handlers::{
    AgentHandler, ApiHandler, BlockHandler, ConditionHandler, EvaluatorHandler, FunctionHandler,
    HandlerContext, HandlerOutcome, HandlerRegistry, ResponseHandler, RouterHandler,
    StarterHandler, WorkflowEmbedHandler,
};
use crate::logging::{log_block_dispatch, log_run_summary};
use crate::path::PathTracker;
use crate::persist::{InMemoryPersistence, PersistenceAdapter};
use crate::providers::ProviderRegistry;
use crate::resolver::{ResolvedInputs, Resolver};
use crate::sandbox::{ExprSandbox, Sandbox};
use crate::streaming::{ByteStream, StreamingResponseProcessor};
use crate::subflow::{LoopManager, ParallelManager, ParallelPlan};
use crate::telemetry::{ExecutionLogRecord, TelemetrySink, TracingSink};
use crate::tools::ToolRegistry;
use crate::workflow::{Block, BlockId, BlockKind, SerializedWorkflow};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared read-only collaborators for a run: tool and provider
/// registries, the function sandbox, persistence, and telemetry.
pub struct ExecutorServices {
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub sandbox: Arc<dyn Sandbox>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Default for ExecutorServices {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorServices {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(ToolRegistry::with_builtins()),
            providers: Arc::new(ProviderRegistry::new()),
            sandbox: Arc::new(ExprSandbox),
            persistence: Arc::new(InMemoryPersistence::new()),
            telemetry: Arc::new(TracingSink),
        }
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Arc::new(providers);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workflow_id: String,
    pub trigger: TriggerType,
    pub input: Value,
    pub environment: HashMap<String, String>,
    pub stream: StreamConfig,
    pub workflow_stack: Vec<String>,
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workflow_id: String::new(),
            trigger: TriggerType::Manual,
            input: Value::Null,
            environment: HashMap::new(),
            stream: StreamConfig::default(),
            workflow_stack: Vec::new(),
            cancel: None,
            deadline: None,
        }
    }
}

pub struct ExecutionOutcome {
    pub output: Value,
    pub context: ExecutionContext,
    pub record: ExecutionLogRecord,
    /// Streams taken out of streaming agent blocks, keyed by block id.
    pub streams: Vec<(BlockId, ByteStream)>,
}

type BranchJoin = JoinHandle<(ExecutionContext, Result<(), ExecutionError>)>;

/// The graph interpreter: advances the workflow block by block, honoring
/// selective activation, loop and parallel lifecycles, streaming, and
/// cancellation.
#[derive(Clone)]
pub struct Executor {
    workflow: Arc<SerializedWorkflow>,
    services: Arc<ExecutorServices>,
    handlers: Arc<HandlerRegistry>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl Executor {
    pub fn new(workflow: Arc<SerializedWorkflow>, services: Arc<ExecutorServices>) -> Self {
        let handlers = Arc::new(Self::default_registry(&services));
        let (events, _) = broadcast::channel(256);
        Self {
            workflow,
            services,
            handlers,
            events,
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn workflow(&self) -> &SerializedWorkflow {
        &self.workflow
    }

    fn default_registry(services: &Arc<ExecutorServices>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(BlockKind::Starter, Arc::new(StarterHandler));
        registry.register(
            BlockKind::Agent,
            Arc::new(AgentHandler::new(services.providers.clone())),
        );
        registry.register(BlockKind::Api, Arc::new(ApiHandler::new(services.tools.clone())));
        registry.register(
            BlockKind::Function,
            Arc::new(FunctionHandler::new(services.sandbox.clone())),
        );
        registry.register(
            BlockKind::Router,
            Arc::new(RouterHandler::new(services.providers.clone())),
        );
        registry.register(BlockKind::Condition, Arc::new(ConditionHandler));
        registry.register(
            BlockKind::Evaluator,
            Arc::new(EvaluatorHandler::new(services.providers.clone())),
        );
        registry.register(BlockKind::Response, Arc::new(ResponseHandler));
        registry.register(
            BlockKind::Workflow,
            Arc::new(WorkflowEmbedHandler::new(services.clone())),
        );
        registry
    }

    /// Run the workflow to completion, cancellation, or failure. Logs are
    /// persisted and the telemetry sink notified in every case.
    pub async fn execute(&self, options: RunOptions) -> Result<ExecutionOutcome, ExecutionError> {
        let cancel = options.cancel.unwrap_or_default();
        let mut ctx = ExecutionContext::new(options.workflow_id, options.trigger, options.input);
        ctx.environment = options.environment;
        ctx.stream_config = options.stream;
        ctx.metadata.workflow_stack = options.workflow_stack;

        let _ = self.events.send(ExecutionEvent::RunStarted {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id.clone(),
            timestamp: Utc::now(),
        });

        let mut streams = Vec::new();
        let run_result = match options.deadline {
            Some(deadline) => {
                tokio::select! {
                    result = self.run(&mut ctx, &mut streams, &cancel) => result,
                    () = tokio::time::sleep(deadline) => {
                        cancel.cancel();
                        Err(ExecutionError::DeadlineExceeded)
                    }
                }
            }
            None => self.run(&mut ctx, &mut streams, &cancel).await,
        };

        let ended_at = Utc::now();
        ctx.metadata.ended_at = Some(ended_at);
        ctx.metadata.duration_ms =
            (ended_at - ctx.metadata.started_at).num_milliseconds().max(0) as u64;

        let record = ExecutionLogRecord::from_context(&ctx);
        if let Err(err) = self
            .services
            .persistence
            .save_execution_logs(record.clone())
            .await
        {
            warn!(error = %err, "failed to persist execution logs");
        }
        self.services.telemetry.record(&record).await;

        let _ = self.events.send(ExecutionEvent::RunCompleted {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id.clone(),
            success: run_result.is_ok(),
            timestamp: Utc::now(),
        });

        log_run_summary(
            &ctx.workflow_id,
            ctx.executed_blocks.len(),
            ctx.metadata.duration_ms,
        );

        let last_output = run_result?;
        let output = ctx
            .terminal_output
            .clone()
            .or(last_output)
            .unwrap_or(Value::Null);

        Ok(ExecutionOutcome {
            output,
            record,
            streams,
            context: ctx,
        })
    }

    async fn run(
        &self,
        ctx: &mut ExecutionContext,
        streams: &mut Vec<(BlockId, ByteStream)>,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, ExecutionError> {
        let starter = self.workflow.starter()?;
        ctx.activate(&starter.id);

        let mut last_output = None;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let layer = self.next_layer(ctx);
            if layer.is_empty() {
                break;
            }
            let terminated = self
                .execute_layer(ctx, &layer, streams, cancel, &mut last_output)
                .await?;
            if terminated {
                break;
            }
        }
        Ok(last_output)
    }

    /// Sub-run used by parallel branches: the frontier is seeded with the
    /// branch entry targets and drains inside the enclosed subgraph.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) so the
    /// recursive call through `execute_layer`'s `Parallel` branch has a
    /// concrete type to close over; an opaque `impl Future` here creates a
    /// self-referential type the compiler cannot prove `Send` for.
    fn run_branch(
        self,
        mut ctx: ExecutionContext,
        entries: Vec<BlockId>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, (ExecutionContext, Result<(), ExecutionError>)> {
        Box::pin(async move {
            self.activate_targets(&mut ctx, &entries);

            let mut streams = Vec::new();
            let mut last_output = None;
            loop {
                if cancel.is_cancelled() {
                    return (ctx, Err(ExecutionError::Cancelled));
                }
                let layer = self.next_layer(&ctx);
                if layer.is_empty() {
                    break;
                }
                match self
                    .execute_layer(&mut ctx, &layer, &mut streams, &cancel, &mut last_output)
                    .await
                {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => return (ctx, Err(err)),
                }
            }
            (ctx, Ok(()))
        })
    }

    /// The frontier: blocks in the active path whose required
    /// predecessors are settled. Loop containers re-enter while their
    /// current iteration is finished and the loop is not completed.
    fn next_layer(&self, ctx: &ExecutionContext) -> Vec<BlockId> {
        let tracker = PathTracker::new(&self.workflow);
        let mut active: Vec<&BlockId> = ctx.active_execution_path.iter().collect();
        active.sort();

        let mut layer = Vec::new();
        for block_id in active {
            let Some(block) = self.workflow.block(block_id) else {
                continue;
            };
            match block.kind {
                BlockKind::Loop => {
                    if ctx.completed_loops.contains(block_id) {
                        continue;
                    }
                    let Some(def) = self.workflow.loops.get(block_id) else {
                        continue;
                    };
                    let started = ctx.loop_iterations.contains_key(block_id);
                    let eligible = if started {
                        tracker.subflow_iteration_done(&def.nodes, ctx)
                    } else {
                        tracker.dependencies_satisfied(block, ctx)
                    };
                    if eligible {
                        layer.push(block_id.clone());
                    }
                }
                _ => {
                    if ctx.is_executed(block_id) {
                        continue;
                    }
                    if tracker.dependencies_satisfied(block, ctx) {
                        layer.push(block_id.clone());
                    }
                }
            }
        }
        layer
    }

    async fn execute_layer(
        &self,
        ctx: &mut ExecutionContext,
        layer: &[BlockId],
        streams: &mut Vec<(BlockId, ByteStream)>,
        cancel: &CancellationToken,
        last_output: &mut Option<Value>,
    ) -> Result<bool, ExecutionError> {
        let mut dispatches: Vec<(Block, ResolvedInputs)> = Vec::new();
        let mut parallel_joins: Vec<(Block, ParallelPlan, DateTime<Utc>, Vec<BranchJoin>)> =
            Vec::new();
        let mut terminated = false;

        // Sync phase: disabled pass-through, loop ticks, input resolution,
        // and parallel fan-out. Mutations are complete before any handler
        // future borrows the context.
        for (position, block_id) in layer.iter().enumerate() {
            let Some(block) = self.workflow.block(block_id).cloned() else {
                continue;
            };
            log_block_dispatch(&block.id, block.kind.as_str(), position);

            if !block.enabled {
                self.pass_through_disabled(ctx, &block);
                continue;
            }

            match block.kind {
                BlockKind::Loop => {
                    self.tick_loop(ctx, &block, last_output)?;
                }
                BlockKind::Parallel => {
                    let started = Utc::now();
                    let plan = self.plan_parallel(ctx, &block)?;
                    let mut handles = Vec::new();
                    for (index, item) in plan.items.iter().enumerate() {
                        let branch_ctx =
                            ctx.fork_branch(&plan.subflow_id, index, item.clone(), &plan.nodes);
                        // Boxed so branch recursion stays a finite type.
                        let branch: BoxFuture<
                            'static,
                            (ExecutionContext, Result<(), ExecutionError>),
                        > = self.clone().run_branch(
                            branch_ctx,
                            plan.entry_targets.clone(),
                            cancel.clone(),
                        );
                        handles.push(tokio::spawn(branch));
                    }
                    parallel_joins.push((block, plan, started, handles));
                }
                _ => {
                    let resolver = Resolver::new(&self.workflow);
                    match resolver.resolve_inputs(&block, ctx) {
                        Ok(inputs) => dispatches.push((block, inputs)),
                        Err(err) => {
                            let started = Utc::now();
                            let err = err.at_block(&block.id, &block.name);
                            self.log_failure(ctx, &block, started, Utc::now(), &err);
                            return Err(err);
                        }
                    }
                }
            }
        }

        // Concurrent phase: every plain handler in the layer runs against
        // the same pre-layer snapshot of the context.
        let shared: &ExecutionContext = ctx;
        type HandlerRun = (
            Block,
            DateTime<Utc>,
            DateTime<Utc>,
            Result<HandlerOutcome, ExecutionError>,
        );
        let handler_futures: Vec<BoxFuture<'_, HandlerRun>> = dispatches
            .into_iter()
            .map(|(block, inputs)| {
                let fut: BoxFuture<'_, HandlerRun> = Box::pin(async move {
                    let started = Utc::now();
                    let _ = self.events.send(ExecutionEvent::BlockStarted {
                        execution_id: shared.execution_id,
                        block_id: block.id.clone(),
                        timestamp: started,
                    });
                    let outcome = match self.handlers.find(&block) {
                        Some(handler) => {
                            handler
                                .execute(
                                    &block,
                                    inputs,
                                    HandlerContext {
                                        workflow: &self.workflow,
                                        ctx: shared,
                                        cancel,
                                    },
                                )
                                .await
                        }
                        None => Err(ExecutionError::UnknownBlockKind(
                            block.kind.as_str().to_string(),
                        )),
                    };
                    (block, started, Utc::now(), outcome)
                });
                fut
            })
            .collect();

        let handler_results = futures::future::join_all(handler_futures).await;

        // Mutation phase: record outputs and decisions, extend the active
        // path, then settle parallel joins.
        let mut first_error: Option<ExecutionError> = None;
        for (block, started, ended, outcome) in handler_results {
            match outcome {
                Ok(HandlerOutcome::Output(output)) => {
                    let stop =
                        self.complete_block(ctx, &block, started, ended, output, last_output);
                    terminated = terminated || stop;
                }
                Ok(HandlerOutcome::Stream { stream, execution }) => {
                    let processed = StreamingResponseProcessor::apply(
                        stream,
                        &block.id,
                        &ctx.stream_config.selected_outputs,
                    );
                    streams.push((block.id.clone(), processed));
                    let stop =
                        self.complete_block(ctx, &block, started, ended, execution, last_output);
                    terminated = terminated || stop;
                }
                Err(err) => {
                    let err = err.at_block(&block.id, &block.name);
                    self.log_failure(ctx, &block, started, ended, &err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        for (block, plan, started, handles) in parallel_joins {
            let mut branch_outputs = vec![Value::Null; plan.branch_count];
            let mut branch_errors = Vec::new();

            for (index, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok((branch_ctx, Ok(()))) => {
                        branch_outputs[index] = ParallelManager::branch_output(
                            &self.workflow,
                            &plan.nodes,
                            &branch_ctx,
                        );
                        ctx.merge_branch(branch_ctx);
                    }
                    Ok((branch_ctx, Err(err))) => {
                        ctx.merge_branch(branch_ctx);
                        branch_errors.push(err);
                    }
                    Err(join_err) => {
                        branch_errors.push(ExecutionError::Internal(format!(
                            "parallel branch task failed: {join_err}"
                        )));
                    }
                }
            }

            if branch_errors.is_empty() {
                let output = ParallelManager::join(branch_outputs);
                ctx.completed_parallels.insert(plan.subflow_id.clone());
                ctx.deactivate(&block.id);
                ctx.record_output(&block.id, output.clone());
                self.push_log(ctx, &block, started, Utc::now(), true, false, None, &output);
                *last_output = Some(output.as_value());
                self.activate_targets(ctx, &plan.end_targets);
            } else {
                let err = ExecutionError::Aggregate {
                    errors: branch_errors,
                }
                .at_block(&block.id, &block.name);
                self.log_failure(ctx, &block, started, Utc::now(), &err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(terminated),
        }
    }

    /// Record a completed block: output, log, decisions, activation.
    /// Returns true when the block terminates the workflow.
    fn complete_block(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        output: BlockOutput,
        last_output: &mut Option<Value>,
    ) -> bool {
        match &output {
            BlockOutput::Router(decision) => {
                ctx.decisions
                    .router
                    .insert(block.id.clone(), decision.selected_path.block_id.clone());
            }
            BlockOutput::Condition(decision) => {
                ctx.decisions
                    .condition
                    .insert(block.id.clone(), decision.branch.clone());
            }
            _ => {}
        }

        ctx.deactivate(&block.id);
        ctx.record_output(&block.id, output.clone());
        self.push_log(ctx, block, started, ended, true, false, None, &output);
        *last_output = Some(output.as_value());

        let _ = self.events.send(ExecutionEvent::BlockCompleted {
            execution_id: ctx.execution_id,
            block_id: block.id.clone(),
            output: output.as_value(),
            timestamp: ended,
        });

        if block.kind == BlockKind::Response {
            ctx.terminal_output = Some(output.as_value());
            return true;
        }

        let tracker = PathTracker::new(&self.workflow);
        let targets = tracker.live_targets(block, ctx);
        self.activate_targets(ctx, &targets);
        false
    }

    fn tick_loop(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        last_output: &mut Option<Value>,
    ) -> Result<(), ExecutionError> {
        let started = Utc::now();
        let Some(def) = self.workflow.loops.get(&block.id).cloned() else {
            let err = ExecutionError::Validation {
                message: format!("loop block {} has no loop definition", block.id),
                block_id: Some(block.id.clone()),
            };
            self.log_failure(ctx, block, started, Utc::now(), &err);
            return Err(err);
        };

        match LoopManager::tick(&self.workflow, &def, ctx) {
            Ok(result) => {
                ctx.record_output(&block.id, result.output.clone());
                self.push_log(
                    ctx,
                    block,
                    started,
                    Utc::now(),
                    true,
                    false,
                    None,
                    &result.output,
                );
                *last_output = Some(result.output.as_value());
                if result.completed {
                    ctx.deactivate(&block.id);
                }
                self.activate_targets(ctx, &result.activate);
                Ok(())
            }
            Err(err) => {
                let err = err.at_block(&block.id, &block.name);
                self.log_failure(ctx, block, started, Utc::now(), &err);
                Err(err)
            }
        }
    }

    fn plan_parallel(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
    ) -> Result<ParallelPlan, ExecutionError> {
        let Some(def) = self.workflow.parallels.get(&block.id).cloned() else {
            let err = ExecutionError::Validation {
                message: format!("parallel block {} has no parallel definition", block.id),
                block_id: Some(block.id.clone()),
            };
            self.log_failure(ctx, block, Utc::now(), Utc::now(), &err);
            return Err(err);
        };
        ParallelManager::plan(&self.workflow, &def, ctx).map_err(|err| {
            let err = err.at_block(&block.id, &block.name);
            self.log_failure(ctx, block, Utc::now(), Utc::now(), &err);
            err
        })
    }

    /// Disabled blocks are structurally present but skipped: consumers
    /// see a null output and activation flows through.
    fn pass_through_disabled(&self, ctx: &mut ExecutionContext, block: &Block) {
        if ctx.is_executed(&block.id) {
            return;
        }
        let now = Utc::now();
        ctx.deactivate(&block.id);
        ctx.record_output(&block.id, BlockOutput::null());
        self.push_log(ctx, block, now, now, true, true, None, &BlockOutput::null());

        let tracker = PathTracker::new(&self.workflow);
        let targets = tracker.live_targets(block, ctx);
        self.activate_targets(ctx, &targets);
    }

    fn activate_targets(&self, ctx: &mut ExecutionContext, targets: &[BlockId]) {
        for target in targets {
            let Some(block) = self.workflow.block(target).cloned() else {
                continue;
            };
            if !block.enabled {
                self.pass_through_disabled(ctx, &block);
            } else {
                ctx.activate(target);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_log(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        success: bool,
        skipped: bool,
        error: Option<String>,
        output: &BlockOutput,
    ) {
        ctx.block_logs.push(BlockLog {
            block_id: block.id.clone(),
            block_name: block.name.clone(),
            block_kind: block.kind,
            branch_index: ctx.parallel_scope.as_ref().map(|scope| scope.index),
            started_at: started,
            ended_at: ended,
            duration_ms: (ended - started).num_milliseconds().max(0) as u64,
            success,
            skipped,
            error,
            output: if success {
                Some(output.as_value())
            } else {
                None
            },
        });
    }

    fn log_failure(
        &self,
        ctx: &mut ExecutionContext,
        block: &Block,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        err: &ExecutionError,
    ) {
        ctx.deactivate(&block.id);
        ctx.executed_blocks.insert(block.id.clone());
        ctx.block_logs.push(BlockLog {
            block_id: block.id.clone(),
            block_name: block.name.clone(),
            block_kind: block.kind,
            branch_index: ctx.parallel_scope.as_ref().map(|scope| scope.index),
            started_at: started,
            ended_at: ended,
            duration_ms: (ended - started).num_milliseconds().max(0) as u64,
            success: false,
            skipped: false,
            error: Some(err.to_string()),
            output: None,
        });
        let _ = self.events.send(ExecutionEvent::BlockFailed {
            execution_id: ctx.execution_id,
            block_id: block.id.clone(),
            error: err.to_string(),
            timestamp: ended,
        });
    }
}
