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
use crate::workflow::{handles, Block, BlockKind, Connection, SerializedWorkflow};

/// Central routing predicate. An edge is skipped when its scaffold handle
/// does not target the matching subflow container, or when it carries a
/// condition branch other than the chosen one. Edges without a handle are
/// never skipped, whatever their target kind.
pub fn should_skip_connection(
    conn: &Connection,
    target_kind: BlockKind,
    ctx: &ExecutionContext,
) -> bool {
    match conn.source_handle.as_deref() {
        Some(handles::LOOP_START) | Some(handles::LOOP_END) => target_kind != BlockKind::Loop,
        Some(handles::PARALLEL_START) | Some(handles::PARALLEL_END) => {
            target_kind != BlockKind::Parallel
        }
        Some(handle) if handle.starts_with(handles::CONDITION_PREFIX) => {
            match ctx.decisions.condition.get(&conn.source) {
                Some(branch) => *handle != handles::condition_handle(&conn.source, branch),
                None => false,
            }
        }
        _ => false,
    }
}

/// True when the edge can no longer carry activation: skipped by the
/// predicate above, or leaving a router through an unchosen target.
fn connection_is_dead(
    conn: &Connection,
    target_kind: BlockKind,
    ctx: &ExecutionContext,
) -> bool {
    if should_skip_connection(conn, target_kind, ctx) {
        return true;
    }
    if let Some(chosen) = ctx.decisions.router.get(&conn.source) {
        if *chosen != conn.target {
            return true;
        }
    }
    false
}

pub struct PathTracker<'a> {
    workflow: &'a SerializedWorkflow,
}

impl<'a> PathTracker<'a> {
    pub fn new(workflow: &'a SerializedWorkflow) -> Self {
        Self { workflow }
    }

    /// Outgoing edges of a just-completed regular block that are live.
    /// Scaffold edges never participate here; the subflow managers
    /// activate their start/end targets explicitly.
    pub fn live_targets(&self, block: &Block, ctx: &ExecutionContext) -> Vec<String> {
        self.workflow
            .outgoing(&block.id)
            .filter(|conn| {
                conn.source_handle
                    .as_deref()
                    .map_or(true, |h| !handles::is_scaffold(h))
            })
            .filter(|conn| {
                let Some(target_kind) = self.workflow.kind_of(&conn.target) else {
                    return false;
                };
                !connection_is_dead(conn, target_kind, ctx)
            })
            .map(|conn| conn.target.clone())
            .collect()
    }

    /// A block is eligible once at least one predecessor made it live and
    /// none of its required predecessors is still pending. A predecessor
    /// is required unless it sits on an unchosen router or condition
    /// branch.
    pub fn dependencies_satisfied(&self, block: &Block, ctx: &ExecutionContext) -> bool {
        for conn in self.workflow.incoming(&block.id) {
            if connection_is_dead(conn, block.kind, ctx) {
                continue;
            }
            if ctx.is_active(&conn.source) && !ctx.is_executed(&conn.source) {
                return false;
            }
        }
        true
    }

    /// Whether a loop container may tick again: every inner block that
    /// entered the active path has finished.
    pub fn subflow_iteration_done(&self, nodes: &[String], ctx: &ExecutionContext) -> bool {
        nodes
            .iter()
            .all(|node| !ctx.is_active(node) || ctx.is_executed(node))
    }
}
