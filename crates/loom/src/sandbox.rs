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

//! Isolation boundary for function blocks. Timeouts and memory limits are
//! the implementation's concern; the engine surfaces sandbox errors
//! verbatim.

use crate::resolver::expr;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run untrusted `code` with `input` bound; returns the single value
    /// the code evaluates to.
    async fn run(
        &self,
        code: &str,
        input: Value,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value, String>;
}

/// In-process default: evaluates the code as a single expression over
/// `input` using the engine's expression grammar. Good enough for demos
/// and tests; real deployments bind an isolated runtime instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprSandbox;

#[async_trait]
impl Sandbox for ExprSandbox {
    async fn run(
        &self,
        code: &str,
        input: Value,
        _timeout: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<Value, String> {
        let parsed = expr::parse(code).map_err(|e| e.to_string())?;
        expr::eval(&parsed, &move |path| {
            if path.first().map(String::as_str) == Some("input") {
                let mut current = &input;
                for seg in &path[1..] {
                    current = match seg.parse::<usize>() {
                        Ok(index) => current.get(index)?,
                        Err(_) => current.get(seg)?,
                    };
                }
                Some(current.clone())
            } else {
                None
            }
        })
        .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn evaluates_expressions_over_input() {
        let sandbox = ExprSandbox;
        let result = sandbox
            .run(
                "input.a == 1 && input.b.c > 2",
                json!({"a": 1, "b": {"c": 3}}),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[tokio::test]
    async fn surfaces_parse_errors_verbatim() {
        let sandbox = ExprSandbox;
        let err = sandbox
            .run("input.a ==", json!({}), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.contains("unexpected"));
    }
}
