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

pub mod context;
pub mod errors;
pub mod executor;
pub mod handlers;
pub mod logging;
pub mod path;
pub mod persist;
pub mod providers;
pub mod rate_limit;
pub mod resolver;
pub mod sandbox;
pub mod secrets;
pub mod streaming;
pub mod subflow;
pub mod telemetry;
pub mod tools;
pub mod workflow;

pub use context::{
    AgentResponse, BlockLog, BlockOutput, ConditionDecision, ExecutionContext, LoopTick,
    ParallelTick, RouterDecision, StreamConfig, TriggerType,
};
pub use errors::{ExecutionError, SerializeError};
pub use executor::{ExecutionEvent, ExecutionOutcome, Executor, ExecutorServices, RunOptions};
pub use path::should_skip_connection;
pub use persist::{InMemoryPersistence, PersistenceAdapter};
pub use providers::{HttpChatProvider, ProviderClient, ProviderRegistry, ScriptedProvider};
pub use rate_limit::{Plan, RateLimitDecision, RateLimiter};
pub use resolver::{ResolvedInputs, Resolver};
pub use sandbox::{ExprSandbox, Sandbox};
pub use streaming::{ByteStream, StreamingResponseProcessor};
pub use telemetry::{ExecutionLogRecord, TelemetrySink, TraceSpan, TracingSink};
pub use tools::{Tool, ToolRegistry};
pub use workflow::serializer::{EditorWorkflowState, Serializer};
pub use workflow::{
    Block, BlockKind, Connection, LoopDef, LoopType, ParallelDef, ParallelType,
    SerializedWorkflow,
};

pub use tokio_util::sync::CancellationToken;

use serde_json::Value;
use std::sync::Arc;

/// Execute a serialized workflow with default services. Convenience
/// wrapper over [`Executor`] for callers that do not need custom
/// registries.
pub async fn execute_workflow(
    workflow: SerializedWorkflow,
    input: Value,
    services: Option<ExecutorServices>,
) -> Result<ExecutionOutcome, ExecutionError> {
    let services = Arc::new(services.unwrap_or_default());
    let executor = Executor::new(Arc::new(workflow), services);
    executor
        .execute(RunOptions {
            input,
            ..RunOptions::default()
        })
        .await
}
