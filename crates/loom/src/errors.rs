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

use llm_contracts::LLMError;
use serde_json::Value;
use thiserror::Error;

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        block_id: Option<String>,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Unknown block kind: {0}")]
    UnknownBlockKind(String),

    #[error("Provider error: {message}")]
    Provider {
        message: String,
        model: Option<String>,
        status: Option<u16>,
        details: Option<Value>,
    },

    #[error("Invalid routing decision from block {block_id}: {response:?}")]
    InvalidRoutingDecision { block_id: String, response: String },

    #[error("No condition branch matched for block {block_id}")]
    ConditionUnsatisfied { block_id: String },

    #[error("forEach loop {subflow_id} has no collection to iterate")]
    ForEachMissingCollection { subflow_id: String },

    #[error("forEach loop {subflow_id} resolved to an empty collection")]
    ForEachEmpty { subflow_id: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution deadline exceeded")]
    DeadlineExceeded,

    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Missing environment variable: {name}")]
    MissingEnvVar { name: String },

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("{} parallel branch(es) failed", errors.len())]
    Aggregate { errors: Vec<ExecutionError> },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] SerializeError),

    #[error("Block {block_id} ({block_name}) failed: {source}")]
    BlockFailed {
        block_id: String,
        block_name: String,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    /// Attach block identity without double-wrapping already attributed errors.
    pub fn at_block(self, block_id: &str, block_name: &str) -> Self {
        match self {
            ExecutionError::BlockFailed { .. }
            | ExecutionError::Cancelled
            | ExecutionError::DeadlineExceeded => self,
            other => ExecutionError::BlockFailed {
                block_id: block_id.to_string(),
                block_name: block_name.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error kind, unwrapping block attribution.
    pub fn root(&self) -> &ExecutionError {
        match self {
            ExecutionError::BlockFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn block_id(&self) -> Option<&str> {
        match self {
            ExecutionError::BlockFailed { block_id, .. } => Some(block_id),
            ExecutionError::Validation { block_id, .. } => block_id.as_deref(),
            ExecutionError::InvalidRoutingDecision { block_id, .. }
            | ExecutionError::ConditionUnsatisfied { block_id } => Some(block_id),
            _ => None,
        }
    }
}

impl From<LLMError> for ExecutionError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Cancelled => ExecutionError::Cancelled,
            LLMError::Timeout => ExecutionError::Provider {
                message: "provider request timed out".to_string(),
                model: None,
                status: None,
                details: None,
            },
            other => ExecutionError::Provider {
                message: other.to_string(),
                model: None,
                status: None,
                details: None,
            },
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("Unknown block kind {kind:?} on block {block_id}")]
    UnknownBlockKind { kind: String, block_id: String },

    #[error("Edge references missing block: {from} -> {target}")]
    DanglingEdge { from: String, target: String },

    #[error("Workflow must contain exactly one starter block")]
    MissingStarter,

    #[error("Block {block_id} belongs to more than one subflow")]
    DuplicateSubflowMember { block_id: String },
}
