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

pub mod expr;
pub mod parser;

use crate::context::ExecutionContext;
use crate::errors::ExecutionError;
use crate::workflow::{Block, ParamType, SerializedWorkflow};
use parser::{PathSeg, Reference, Segment, Template};
use serde_json::Value;
use std::collections::HashMap;

/// Fresh, fully substituted parameter map handed to a block handler. The
/// underlying block is never mutated.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs(pub HashMap<String, Value>);

impl ResolvedInputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_array(&self, name: &str) -> Option<&Vec<Value>> {
        self.get(name).and_then(Value::as_array)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }
}

pub struct Resolver<'a> {
    workflow: &'a SerializedWorkflow,
}

impl<'a> Resolver<'a> {
    pub fn new(workflow: &'a SerializedWorkflow) -> Self {
        Self { workflow }
    }

    /// Walk a block's params immediately before dispatch and substitute
    /// every template reference, then coerce to the declared input types.
    pub fn resolve_inputs(
        &self,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<ResolvedInputs, ExecutionError> {
        let mut resolved = HashMap::new();
        for (name, raw) in &block.config.params {
            let target = block.inputs.get(name).copied().unwrap_or(ParamType::Any);
            let required = block.inputs.contains_key(name);
            let value = self.resolve_value(raw, ctx, required)?;
            resolved.insert(name.clone(), coerce(name, value, target));
        }
        Ok(ResolvedInputs(resolved))
    }

    /// Resolve one parameter value; strings go through the template
    /// grammar, containers recurse.
    pub fn resolve_value(
        &self,
        raw: &Value,
        ctx: &ExecutionContext,
        required: bool,
    ) -> Result<Value, ExecutionError> {
        match raw {
            Value::String(text) => self.resolve_template(text, ctx, required),
            Value::Array(items) => {
                let resolved: Result<Vec<_>, _> = items
                    .iter()
                    .map(|item| self.resolve_value(item, ctx, required))
                    .collect();
                Ok(Value::Array(resolved?))
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::new();
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_value(item, ctx, required)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a template string. A single bare reference keeps the value
    /// type of its target; mixed templates stringify.
    pub fn resolve_template(
        &self,
        text: &str,
        ctx: &ExecutionContext,
        required: bool,
    ) -> Result<Value, ExecutionError> {
        let template = Template::parse(text).map_err(|e| ExecutionError::Validation {
            message: e.to_string(),
            block_id: None,
        })?;

        if !template.has_references() {
            return Ok(Value::String(text.to_string()));
        }

        if let Some(reference) = template.single_reference() {
            let value = self.eval_reference(reference, ctx, required)?;
            return Ok(value.unwrap_or(Value::Null));
        }

        let mut out = String::new();
        for segment in &template.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Reference(reference) => {
                    let value = self.eval_reference(reference, ctx, required)?;
                    out.push_str(&stringify(&value.unwrap_or(Value::Null)));
                }
            }
        }
        Ok(Value::String(out))
    }

    /// Resolve templates inside an expression, substituting values as
    /// expression literals, then evaluate the boolean grammar.
    pub fn resolve_expression(
        &self,
        text: &str,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let template = Template::parse(text).map_err(|e| ExecutionError::Validation {
            message: e.to_string(),
            block_id: None,
        })?;

        let mut source = String::new();
        for segment in &template.segments {
            match segment {
                Segment::Text(t) => source.push_str(t),
                Segment::Reference(reference) => {
                    let value = self
                        .eval_reference(reference, ctx, false)?
                        .unwrap_or(Value::Null);
                    source.push_str(
                        &serde_json::to_string(&value)
                            .unwrap_or_else(|_| "null".to_string()),
                    );
                }
            }
        }

        let parsed = expr::parse(&source).map_err(|e| ExecutionError::Validation {
            message: format!("invalid expression {source:?}: {e}"),
            block_id: None,
        })?;
        let input = ctx.initial_input.clone();
        let environment = ctx.environment.clone();
        expr::eval(&parsed, &move |path| {
            lookup_context_path(&input, &environment, path)
        })
        .map_err(|e| ExecutionError::Validation {
            message: format!("expression evaluation failed: {e}"),
            block_id: None,
        })
    }

    fn eval_reference(
        &self,
        reference: &Reference,
        ctx: &ExecutionContext,
        required: bool,
    ) -> Result<Option<Value>, ExecutionError> {
        match reference.root.as_str() {
            "env" => {
                let Some(PathSeg::Key(name)) = reference.path.first() else {
                    return Err(ExecutionError::Validation {
                        message: "env reference requires a variable name".to_string(),
                        block_id: None,
                    });
                };
                match ctx.environment.get(name) {
                    Some(value) => Ok(Some(Value::String(value.clone()))),
                    None if required => Err(ExecutionError::MissingEnvVar { name: name.clone() }),
                    None => Ok(None),
                }
            }
            "loop" => Ok(self.eval_loop_reference(reference, ctx)),
            "parallel" => Ok(eval_parallel_reference(reference, ctx)),
            root => {
                let Some(block) = self.find_block(root) else {
                    return Err(ExecutionError::Validation {
                        message: format!("reference to unknown block {root:?}"),
                        block_id: None,
                    });
                };
                let Some(state) = ctx.state_of(&block.id) else {
                    return Ok(None);
                };
                Ok(walk_path(&state.as_value(), &reference.path))
            }
        }
    }

    fn eval_loop_reference(&self, reference: &Reference, ctx: &ExecutionContext) -> Option<Value> {
        let mut path = reference.path.iter();
        let PathSeg::Key(subflow_id) = path.next()? else {
            return None;
        };
        let PathSeg::Key(field) = path.next()? else {
            return None;
        };
        let rest: Vec<PathSeg> = path.cloned().collect();

        let base = match field.as_str() {
            "item" => ctx.loop_items.get(subflow_id)?.clone(),
            "index" => {
                let next = ctx.loop_iterations.get(subflow_id).copied()?;
                Value::from(next.saturating_sub(1))
            }
            "results" => Value::Array(
                ctx.loop_results
                    .get(subflow_id)
                    .cloned()
                    .unwrap_or_default(),
            ),
            _ => return None,
        };
        walk_path(&base, &rest)
    }

    fn find_block(&self, root: &str) -> Option<&Block> {
        if let Some(block) = self.workflow.block(root) {
            return Some(block);
        }
        let normalized = normalize_name(root);
        self.workflow
            .blocks
            .values()
            .find(|b| normalize_name(&b.name) == normalized)
    }
}

fn eval_parallel_reference(reference: &Reference, ctx: &ExecutionContext) -> Option<Value> {
    let mut path = reference.path.iter();
    let PathSeg::Key(subflow_id) = path.next()? else {
        return None;
    };
    let PathSeg::Key(field) = path.next()? else {
        return None;
    };
    let rest: Vec<PathSeg> = path.cloned().collect();

    let scope = ctx.parallel_scope.as_ref()?;
    if scope.subflow_id != *subflow_id {
        return None;
    }
    let base = match field.as_str() {
        "item" => scope.item.clone(),
        "index" => Value::from(scope.index as u64),
        _ => return None,
    };
    walk_path(&base, &rest)
}

fn lookup_context_path(
    input: &Value,
    environment: &HashMap<String, String>,
    path: &[String],
) -> Option<Value> {
    match path.first().map(String::as_str) {
        Some("input") => {
            let segs: Vec<PathSeg> = path[1..]
                .iter()
                .map(|s| match s.parse::<usize>() {
                    Ok(i) => PathSeg::Index(i),
                    Err(_) => PathSeg::Key(s.clone()),
                })
                .collect();
            walk_path(input, &segs)
        }
        Some("env") => path
            .get(1)
            .and_then(|name| environment.get(name))
            .map(|v| Value::String(v.clone())),
        _ => None,
    }
}

fn walk_path(value: &Value, path: &[PathSeg]) -> Option<Value> {
    let mut current = value;
    for seg in path {
        current = match seg {
            PathSeg::Key(key) => current.get(key)?,
            PathSeg::Index(index) => current.get(index)?,
        };
    }
    Some(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Block-name references are matched case-insensitively with spacing and
/// punctuation removed.
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Type-aware coercion toward the declared parameter type. URL parameters
/// shed surrounding quotes before validation.
fn coerce(name: &str, value: Value, target: ParamType) -> Value {
    let value = if name == "url" {
        strip_quotes(value)
    } else {
        value
    };

    match target {
        ParamType::Number => match &value {
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(int) = trimmed.parse::<i64>() {
                    Value::from(int)
                } else if let Ok(float) = trimmed.parse::<f64>() {
                    serde_json::json!(float)
                } else {
                    value
                }
            }
            _ => value,
        },
        ParamType::Boolean => match &value {
            Value::String(s) => match s.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => value,
            },
            _ => value,
        },
        ParamType::Json => match &value {
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    serde_json::from_str(trimmed).unwrap_or(value)
                } else {
                    value
                }
            }
            _ => value,
        },
        ParamType::String | ParamType::Any => value,
    }
}

fn strip_quotes(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let stripped = trimmed
                .strip_prefix('"')
                .and_then(|rest| rest.strip_suffix('"'))
                .or_else(|| {
                    trimmed
                        .strip_prefix('\'')
                        .and_then(|rest| rest.strip_suffix('\''))
                });
            Value::String(stripped.unwrap_or(trimmed).to_string())
        }
        other => other,
    }
}
