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

use crate::context::ExecutionContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    pub id: Uuid,
    pub block_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceSpan>,
}

/// The persisted record of one run, append-only and idempotent by
/// execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogRecord {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub level: LogLevel,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub block_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub skipped_count: usize,
    pub total_cost: f64,
    pub total_tokens: u32,
    pub trace_spans: Vec<TraceSpan>,
}

impl ExecutionLogRecord {
    /// Assemble the record from a finished (or failed) run context.
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let ended_at = ctx.metadata.ended_at.unwrap_or_else(Utc::now);
        let trace_spans: Vec<TraceSpan> = ctx
            .block_logs
            .iter()
            .map(|log| TraceSpan {
                id: Uuid::new_v4(),
                block_id: log.block_id.clone(),
                name: log.block_name.clone(),
                span_type: log.block_kind.as_str().to_string(),
                start_time: log.started_at,
                end_time: log.ended_at,
                duration: log.duration_ms,
                status: if log.success { "success" } else { "error" }.to_string(),
                input: None,
                output: log.output.clone(),
                cost: None,
                children: Vec::new(),
            })
            .collect();

        let success_count = ctx
            .block_logs
            .iter()
            .filter(|l| l.success && !l.skipped)
            .count();
        let error_count = ctx.block_logs.iter().filter(|l| !l.success).count();
        let skipped_count = ctx.block_logs.iter().filter(|l| l.skipped).count();

        ExecutionLogRecord {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id.clone(),
            level: if error_count == 0 {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            trigger: ctx.trigger.as_str().to_string(),
            started_at: ctx.metadata.started_at,
            ended_at,
            total_duration_ms: ctx.metadata.duration_ms,
            block_count: ctx.block_logs.len(),
            success_count,
            error_count,
            skipped_count,
            total_cost: ctx.total_cost(),
            total_tokens: ctx.total_usage().total_tokens,
            trace_spans,
        }
    }
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: &ExecutionLogRecord);
}

/// Default sink: structured tracing output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn record(&self, record: &ExecutionLogRecord) {
        info!(
            execution_id = %record.execution_id,
            workflow_id = %record.workflow_id,
            trigger = %record.trigger,
            duration_ms = record.total_duration_ms,
            blocks = record.block_count,
            errors = record.error_count,
            tokens = record.total_tokens,
            "execution finished"
        );
    }
}
