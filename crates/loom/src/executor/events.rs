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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: Uuid,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    BlockStarted {
        execution_id: Uuid,
        block_id: String,
        timestamp: DateTime<Utc>,
    },
    BlockCompleted {
        execution_id: Uuid,
        block_id: String,
        output: Value,
        timestamp: DateTime<Utc>,
    },
    BlockFailed {
        execution_id: Uuid,
        block_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: Uuid,
        workflow_id: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
}
