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

use crate::errors::ExecutionError;
use crate::secrets::{hash_secret, StoredSecret};
use crate::telemetry::ExecutionLogRecord;
use crate::workflow::SerializedWorkflow;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn load_workflow(&self, id: &str) -> Result<SerializedWorkflow, ExecutionError>;

    /// Append-only; a second save with the same execution id is a no-op.
    async fn save_execution_logs(&self, record: ExecutionLogRecord)
        -> Result<(), ExecutionError>;

    /// Returns decrypted variables; plaintext lives only inside the run.
    async fn load_environment_variables(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, String>, ExecutionError>;
}

#[derive(Debug, Clone)]
struct SecretEntry {
    stored: StoredSecret,
    plaintext: String,
}

/// In-memory adapter for tests and demos.
#[derive(Default)]
pub struct InMemoryPersistence {
    workflows: RwLock<HashMap<String, SerializedWorkflow>>,
    logs: RwLock<Vec<ExecutionLogRecord>>,
    environments: RwLock<HashMap<String, HashMap<String, SecretEntry>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_workflow(&self, id: impl Into<String>, workflow: SerializedWorkflow) {
        self.workflows.write().await.insert(id.into(), workflow);
    }

    pub async fn put_environment_variable(
        &self,
        user_id: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let value = value.into();
        let entry = SecretEntry {
            stored: hash_secret(&value),
            plaintext: value,
        };
        self.environments
            .write()
            .await
            .entry(user_id.into())
            .or_default()
            .insert(name.into(), entry);
    }

    pub async fn stored_secret(&self, user_id: &str, name: &str) -> Option<StoredSecret> {
        self.environments
            .read()
            .await
            .get(user_id)
            .and_then(|vars| vars.get(name))
            .map(|entry| entry.stored.clone())
    }

    pub async fn saved_logs(&self) -> Vec<ExecutionLogRecord> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn load_workflow(&self, id: &str) -> Result<SerializedWorkflow, ExecutionError> {
        self.workflows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutionError::WorkflowNotFound(id.to_string()))
    }

    async fn save_execution_logs(
        &self,
        record: ExecutionLogRecord,
    ) -> Result<(), ExecutionError> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|r| r.execution_id == record.execution_id) {
            return Ok(());
        }
        logs.push(record);
        Ok(())
    }

    async fn load_environment_variables(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, String>, ExecutionError> {
        Ok(self
            .environments
            .read()
            .await
            .get(user_id)
            .map(|vars| {
                vars.iter()
                    .map(|(name, entry)| (name.clone(), entry.plaintext.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
