//! `StateStore` trait definition and the persisted row types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::governance::GovernanceContext;
use crate::workflow::{Task, TaskStatus, Workflow, WorkflowStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Task not found
    #[error("task not found: {workflow_id}/{task_id}")]
    TaskNotFound {
        workflow_id: String,
        task_id: String,
    },

    /// A stored row's signature does not verify
    #[error("row signature mismatch for {0}")]
    SignatureMismatch(String),

    /// A sensitive row arrived but the store has no field cipher
    #[error("encryption key required to persist sensitive fields of {0}")]
    EncryptionRequired(String),

    /// Field encryption or decryption failed
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Persisted workflow row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,

    /// Original definition document as submitted
    pub definition: Value,

    pub status: WorkflowStatus,

    pub idempotency_key: Option<String>,

    /// Terminal failure reason, if any
    pub last_error: Option<String>,

    /// Governance inputs captured at submission, replayed on resume
    pub context: GovernanceContext,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Build the row for a validated workflow and its source definition
    pub fn from_workflow(
        workflow: &Workflow,
        definition: Value,
        context: GovernanceContext,
    ) -> Self {
        Self {
            workflow_id: workflow.workflow_id.clone(),
            definition,
            status: workflow.status,
            idempotency_key: workflow.idempotency_key.clone(),
            last_error: workflow.last_error.clone(),
            context,
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        }
    }
}

/// Persisted task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub workflow_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub last_error: Option<String>,

    /// Derived from the task's data classification; drives at-rest
    /// encryption of this row's error field
    pub sensitive: bool,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn from_task(workflow_id: &str, task: &Task) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            task_id: task.task_id.clone(),
            status: task.status,
            attempt: task.attempt,
            last_error: task.last_error.clone(),
            sensitive: task.data_classification.is_sensitive(),
            started_at: task.started_at,
            finished_at: task.finished_at,
        }
    }
}

/// Canonical byte encoding of a workflow row, signature field excluded
///
/// A fixed-order JSON array sidesteps object key ordering; timestamps are
/// microsecond integers so the encoding survives storage round-trips.
pub fn workflow_canonical(record: &WorkflowRecord) -> Vec<u8> {
    let canonical = serde_json::json!([
        record.workflow_id,
        record.definition,
        record.status.to_string(),
        record.idempotency_key,
        record.last_error,
        record.context,
        record.created_at.timestamp_micros(),
        record.updated_at.timestamp_micros(),
    ]);
    canonical.to_string().into_bytes()
}

/// Canonical byte encoding of a task row, signature field excluded
pub fn task_canonical(record: &TaskRecord) -> Vec<u8> {
    let canonical = serde_json::json!([
        record.workflow_id,
        record.task_id,
        record.status.to_string(),
        record.attempt,
        record.last_error,
        record.sensitive,
        record.started_at.map(|t| t.timestamp_micros()),
        record.finished_at.map(|t| t.timestamp_micros()),
    ]);
    canonical.to_string().into_bytes()
}

/// Whether any task in a definition document carries a sensitive
/// classification
pub fn definition_is_sensitive(definition: &Value) -> bool {
    definition
        .get("tasks")
        .and_then(Value::as_array)
        .is_some_and(|tasks| {
            tasks.iter().any(|task| {
                matches!(
                    task.get("data_classification").and_then(Value::as_str),
                    Some("pii") | Some("phi")
                )
            })
        })
}

/// Durable key-value persistence for workflow and task state
///
/// Implementations must be thread-safe, provide single-row atomicity, and
/// return from `put_*` only after the row is synced; readers never observe
/// torn writes. The scheduler does not require multi-row transactions.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Insert or replace a workflow row
    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

    /// Fetch a workflow row
    async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Workflows whose status is `Running` (resume candidates)
    async fn list_in_flight(&self) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Insert or replace a task row
    async fn put_task(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a task row
    async fn get_task(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// All task rows of a workflow, ordered by task id
    async fn list_tasks(&self, workflow_id: &str) -> Result<Vec<TaskRecord>, StoreError>;

    /// Atomically flip a task's status from `expected` to `new`
    ///
    /// Returns `false` when the stored status is not `expected`; the caller
    /// re-reads and re-evaluates. This is the double-dispatch guard.
    async fn cas_task_status(
        &self,
        workflow_id: &str,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, StoreError>;
}
