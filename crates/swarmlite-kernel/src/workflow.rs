//! Core data model: workflows, tasks, statuses, and status snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Workflow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet scheduled
    Pending,

    /// Scheduler is driving the workflow
    Running,

    /// Every task finished as success or skipped
    Success,

    /// At least one task failed and nothing remains to run
    Failed,

    /// Stopped by an explicit operator request
    Stopped,
}

impl WorkflowStatus {
    /// Whether this status is terminal (no scheduler will touch it again)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    Pending,

    /// Dependencies satisfied, eligible for dispatch
    Ready,

    /// Handler invocation in flight
    Running,

    /// Handler returned ok
    Success,

    /// Handler failed permanently or retries were exhausted
    Failed,

    /// Compensation handler undid this task's work
    Rollback,

    /// An ancestor failed; this task will never be dispatched
    Skipped,
}

impl TaskStatus {
    /// Whether the task will see no further transitions from the scheduler
    /// (compensation may still move `Success` to `Rollback`)
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Rollback | Self::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Rollback => write!(f, "rollback"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rollback" => Ok(Self::Rollback),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Data classification attached to a task definition
///
/// Sensitive classifications gate execution through governance and force
/// encryption of derived fields at rest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataClassification {
    #[default]
    Public,
    Pii,
    Phi,
}

impl DataClassification {
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Pii | Self::Phi)
    }
}

impl std::fmt::Display for DataClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Pii => write!(f, "pii"),
            Self::Phi => write!(f, "phi"),
        }
    }
}

/// A single task within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,

    /// Handler family tag (e.g. `python`, `http`, `llm`, `db`)
    #[serde(rename = "type")]
    pub task_type: String,

    /// Sibling task ids this task waits on
    pub depends_on: Vec<String>,

    /// Opaque handler configuration; `function` and `params` are the only
    /// keys the kernel itself inspects
    pub config: serde_json::Value,

    pub data_classification: DataClassification,

    pub status: TaskStatus,

    /// Dispatch attempts so far; 0 before the first try
    pub attempt: u32,

    pub last_error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Handler name within the task's type family, if configured
    pub fn function(&self) -> Option<&str> {
        self.config.get("function").and_then(|v| v.as_str())
    }

    /// Parameters forwarded verbatim to the handler
    pub fn params(&self) -> serde_json::Value {
        self.config
            .get("params")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()))
    }

    /// Per-task wall-clock timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .get("timeout_seconds")
            .and_then(|v| v.as_f64())
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// A validated workflow with all invariants established
///
/// Produced by the definition validator; the scheduler mutates task state
/// in this structure as its in-memory mirror of the state store.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub workflow_id: String,

    /// Tasks keyed by id; `BTreeMap` iteration order doubles as the
    /// deterministic dispatch tie-break
    pub tasks: BTreeMap<String, Task>,

    pub retry_policy: RetryPolicy,

    /// Optional compensation handler name per task
    pub compensation_handlers: BTreeMap<String, String>,

    /// Topological order over task ids, ties broken by id; compensation
    /// walks this in reverse
    pub topo_order: Vec<String>,

    pub status: WorkflowStatus,

    pub idempotency_key: Option<String>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Whether any task carries a sensitive classification
    pub fn has_sensitive_tasks(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.data_classification.is_sensitive())
    }

    /// Point-in-time view for the status API
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            last_error: self.last_error.clone(),
            tasks: self.tasks.values().map(TaskSnapshot::from).collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a workflow, assembled from the state store
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub last_error: Option<String>,
    pub tasks: Vec<TaskSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    /// Look up a task snapshot by id
    pub fn task(&self, task_id: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

/// Point-in-time view of a single task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            attempt: task.attempt,
            last_error: task.last_error.clone(),
            started_at: task.started_at,
            finished_at: task.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Success,
            WorkflowStatus::Failed,
            WorkflowStatus::Stopped,
        ] {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkflowStatus::Success.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Stopped.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Pending.is_terminal());
    }

    #[test]
    fn test_task_settled() {
        assert!(TaskStatus::Skipped.is_settled());
        assert!(TaskStatus::Rollback.is_settled());
        assert!(!TaskStatus::Ready.is_settled());
        assert!(!TaskStatus::Running.is_settled());
    }

    #[test]
    fn test_classification_sensitivity() {
        assert!(!DataClassification::Public.is_sensitive());
        assert!(DataClassification::Pii.is_sensitive());
        assert!(DataClassification::Phi.is_sensitive());
        assert_eq!(DataClassification::default(), DataClassification::Public);
    }

    #[test]
    fn test_task_config_accessors() {
        let task = Task {
            task_id: "extract".to_string(),
            task_type: "python".to_string(),
            depends_on: vec![],
            config: serde_json::json!({
                "function": "extract_records",
                "params": { "batch": 100 },
                "timeout_seconds": 30
            }),
            data_classification: DataClassification::Public,
            status: TaskStatus::Pending,
            attempt: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        };

        assert_eq!(task.function(), Some("extract_records"));
        assert_eq!(task.params()["batch"], 100);
        assert_eq!(task.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_task_config_defaults() {
        let task = Task {
            task_id: "t".to_string(),
            task_type: "http".to_string(),
            depends_on: vec![],
            config: serde_json::json!({}),
            data_classification: DataClassification::Public,
            status: TaskStatus::Pending,
            attempt: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        };

        assert_eq!(task.function(), None);
        assert!(task.params().as_object().unwrap().is_empty());
        assert_eq!(task.timeout(), None);
    }
}
