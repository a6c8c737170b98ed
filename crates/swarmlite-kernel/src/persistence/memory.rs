//! In-memory implementation of `StateStore`.
//!
//! The default store for tests and single-process deployments without a
//! database. Rows are signed and sensitive fields sealed exactly as in the
//! PostgreSQL implementation so integrity and encryption paths are
//! exercised everywhere.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::signing::HmacSigner;
use crate::workflow::{TaskStatus, WorkflowStatus};

use super::encryption::FieldCipher;
use super::store::*;

struct StoredRow<T> {
    record: T,
    signature: String,
}

/// In-memory signed state store
pub struct InMemoryStateStore {
    signer: HmacSigner,
    cipher: Option<FieldCipher>,
    workflows: RwLock<HashMap<String, StoredRow<WorkflowRecord>>>,
    tasks: RwLock<BTreeMap<(String, String), StoredRow<TaskRecord>>>,
}

impl InMemoryStateStore {
    pub fn new(signer: HmacSigner, cipher: Option<FieldCipher>) -> Self {
        Self {
            signer,
            cipher,
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
    }

    fn seal_workflow(&self, record: &WorkflowRecord) -> Result<WorkflowRecord, StoreError> {
        let mut stored = record.clone();
        if definition_is_sensitive(&record.definition) {
            let cipher = self.require_cipher(&record.workflow_id)?;
            let plaintext = serde_json::to_vec(&record.definition)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let sealed = cipher
                .seal(&plaintext)
                .map_err(|e| StoreError::Encryption(e.to_string()))?;
            stored.definition = Value::String(sealed);
        }
        Ok(stored)
    }

    fn unseal_workflow(&self, stored: &WorkflowRecord) -> Result<WorkflowRecord, StoreError> {
        let mut record = stored.clone();
        if let Value::String(s) = &stored.definition {
            if FieldCipher::is_sealed(s) {
                let cipher = self.require_cipher(&stored.workflow_id)?;
                let plaintext = cipher
                    .open(s)
                    .map_err(|e| StoreError::Encryption(e.to_string()))?;
                record.definition = serde_json::from_slice(&plaintext)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
            }
        }
        Ok(record)
    }

    fn seal_task(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let mut stored = record.clone();
        if record.sensitive {
            if let Some(error) = &record.last_error {
                let cipher = self.require_cipher(&record.workflow_id)?;
                stored.last_error = Some(
                    cipher
                        .seal_str(error)
                        .map_err(|e| StoreError::Encryption(e.to_string()))?,
                );
            }
        }
        Ok(stored)
    }

    fn unseal_task(&self, stored: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let mut record = stored.clone();
        if let Some(error) = &stored.last_error {
            if FieldCipher::is_sealed(error) {
                let cipher = self.require_cipher(&stored.workflow_id)?;
                record.last_error = Some(
                    cipher
                        .open_str(error)
                        .map_err(|e| StoreError::Encryption(e.to_string()))?,
                );
            }
        }
        Ok(record)
    }

    fn require_cipher(&self, workflow_id: &str) -> Result<&FieldCipher, StoreError> {
        self.cipher
            .as_ref()
            .ok_or_else(|| StoreError::EncryptionRequired(workflow_id.to_string()))
    }

    fn verify_workflow(&self, record: &WorkflowRecord, signature: &str) -> Result<(), StoreError> {
        if self.signer.verify(&workflow_canonical(record), signature) {
            Ok(())
        } else {
            Err(StoreError::SignatureMismatch(record.workflow_id.clone()))
        }
    }

    fn verify_task(&self, record: &TaskRecord, signature: &str) -> Result<(), StoreError> {
        if self.signer.verify(&task_canonical(record), signature) {
            Ok(())
        } else {
            Err(StoreError::SignatureMismatch(format!(
                "{}/{}",
                record.workflow_id, record.task_id
            )))
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        let signature = self.signer.sign(&workflow_canonical(record));
        let stored = self.seal_workflow(record)?;
        self.workflows.write().insert(
            record.workflow_id.clone(),
            StoredRow {
                record: stored,
                signature,
            },
        );
        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let Some(row) = workflows.get(workflow_id) else {
            return Ok(None);
        };
        let record = self.unseal_workflow(&row.record)?;
        self.verify_workflow(&record, &row.signature)?;
        Ok(Some(record))
    }

    async fn list_in_flight(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let mut in_flight = Vec::new();
        for row in workflows.values() {
            if row.record.status == WorkflowStatus::Running {
                let record = self.unseal_workflow(&row.record)?;
                self.verify_workflow(&record, &row.signature)?;
                in_flight.push(record);
            }
        }
        in_flight.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(in_flight)
    }

    async fn put_task(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let signature = self.signer.sign(&task_canonical(record));
        let stored = self.seal_task(record)?;
        self.tasks.write().insert(
            (record.workflow_id.clone(), record.task_id.clone()),
            StoredRow {
                record: stored,
                signature,
            },
        );
        Ok(())
    }

    async fn get_task(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let Some(row) = tasks.get(&(workflow_id.to_string(), task_id.to_string())) else {
            return Ok(None);
        };
        let record = self.unseal_task(&row.record)?;
        self.verify_task(&record, &row.signature)?;
        Ok(Some(record))
    }

    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read();
        let mut result = Vec::new();
        for ((wf, _), row) in tasks.iter() {
            if wf == workflow_id {
                let record = self.unseal_task(&row.record)?;
                self.verify_task(&record, &row.signature)?;
                result.push(record);
            }
        }
        Ok(result)
    }

    async fn cas_task_status(
        &self,
        workflow_id: &str,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let key = (workflow_id.to_string(), task_id.to_string());
        let row = tasks.get_mut(&key).ok_or_else(|| StoreError::TaskNotFound {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
        })?;

        let mut record = self.unseal_task(&row.record)?;
        self.verify_task(&record, &row.signature)?;

        if record.status != expected {
            return Ok(false);
        }

        record.status = new;
        let signature = self.signer.sign(&task_canonical(&record));
        let stored = self.seal_task(&record)?;
        *row = StoredRow {
            record: stored,
            signature,
        };
        Ok(true)
    }
}
