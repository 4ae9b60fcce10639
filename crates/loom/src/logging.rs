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

use serde_json::Value;
use tracing::{debug, error, info};

pub fn log_serializer_event(event: &str, payload: Value) {
    debug!(
        event = event,
        payload = %serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string()),
        "Serializer event"
    );
}

pub fn log_block_dispatch(block_id: &str, block_kind: &str, layer: usize) {
    debug!(
        block_id = block_id,
        block_kind = block_kind,
        layer = layer,
        "Block dispatch"
    );
}

pub fn log_subflow_event(subflow_id: &str, event: &str, iteration: u32) {
    debug!(
        subflow_id = subflow_id,
        event = event,
        iteration = iteration,
        "Subflow event"
    );
}

pub fn log_error(context: &str, error: &dyn std::error::Error) {
    error!(
        context = context,
        error = %error,
        "Execution error"
    );
}

pub fn log_run_summary(workflow_id: &str, blocks_executed: usize, duration_ms: u64) {
    info!(
        workflow_id = workflow_id,
        blocks_executed = blocks_executed,
        duration_ms = duration_ms,
        "Run summary"
    );
}
