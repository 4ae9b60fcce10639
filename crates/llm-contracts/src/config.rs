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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    pub provider_specific: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub provider: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub cost_per_million_tokens: Option<CostPerMillionTokens>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostPerMillionTokens {
    pub input: f64,
    pub output: f64,
}

impl CostPerMillionTokens {
    pub fn cost_for(&self, prompt_tokens: u32, completion_tokens: u32) -> (f64, f64) {
        let input = f64::from(prompt_tokens) / 1_000_000.0 * self.input;
        let output = f64::from(completion_tokens) / 1_000_000.0 * self.output;
        (input, output)
    }
}
