//! Workflow definition parsing and validation.
//!
//! Definitions reach the kernel as a tree of primitive values (the REST
//! layer normalizes YAML and JSON to the same tree before submission).
//! Parsing is pure: no I/O, no side effects. The output is a [`Workflow`]
//! with every structural invariant established, or a typed
//! [`ValidationError`].

mod validate;

pub use validate::validate;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::retry::RetryPolicy;
use crate::workflow::DataClassification;

/// Definition-time failure, surfaced to the submitter before any state is
/// written.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The document is not a JSON object tree
    #[error("invalid definition document: {0}")]
    InvalidDocument(String),

    /// A required field is absent; the path names the missing location
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A field is present but holds an unusable value
    #[error("invalid value at {path}: {reason}")]
    InvalidField { path: String, reason: String },

    /// The workflow declares no tasks
    #[error("workflow has no tasks")]
    EmptyWorkflow,

    /// Two tasks share an id
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// A dependency names a task that does not exist
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    /// The dependency graph contains a cycle; the path lists the ids along
    /// the back edge, first id repeated at the end
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// The retry policy violates its field constraints
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}

/// Raw task definition as submitted
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub id: String,
    pub task_type: String,
    pub depends_on: Vec<String>,
    pub data_classification: DataClassification,
    pub config: Value,
}

/// Raw workflow definition as submitted
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub tasks: Vec<TaskDefinition>,
    pub retry_policy: RetryPolicy,
    pub compensation_handlers: BTreeMap<String, String>,
}

/// Parse a normalized definition tree into a [`WorkflowDefinition`].
pub fn parse_definition(doc: &Value) -> Result<WorkflowDefinition, ValidationError> {
    let root = doc
        .as_object()
        .ok_or_else(|| ValidationError::InvalidDocument("document must be a mapping".into()))?;

    let workflow_id = require_string(root, "workflow_id")?;

    let raw_tasks = root
        .get("tasks")
        .ok_or_else(|| ValidationError::MissingField("tasks".into()))?
        .as_array()
        .ok_or_else(|| ValidationError::InvalidField {
            path: "tasks".into(),
            reason: "must be a sequence".into(),
        })?;

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    for (index, raw) in raw_tasks.iter().enumerate() {
        tasks.push(parse_task(raw, index)?);
    }

    let retry_policy = match root.get("retry_policy") {
        None | Some(Value::Null) => RetryPolicy::default(),
        Some(raw) => parse_retry_policy(raw)?,
    };
    retry_policy
        .validate()
        .map_err(ValidationError::InvalidRetryPolicy)?;

    let compensation_handlers = match root.get("compensation_handlers") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(raw) => {
            let map = raw
                .as_object()
                .ok_or_else(|| ValidationError::InvalidField {
                    path: "compensation_handlers".into(),
                    reason: "must be a mapping of task_id to handler name".into(),
                })?;
            let mut handlers = BTreeMap::new();
            for (task_id, handler) in map {
                let name = handler.as_str().ok_or_else(|| ValidationError::InvalidField {
                    path: format!("compensation_handlers.{task_id}"),
                    reason: "handler name must be a string".into(),
                })?;
                handlers.insert(task_id.clone(), name.to_string());
            }
            handlers
        }
    };

    Ok(WorkflowDefinition {
        workflow_id,
        tasks,
        retry_policy,
        compensation_handlers,
    })
}

fn parse_task(raw: &Value, index: usize) -> Result<TaskDefinition, ValidationError> {
    let path = format!("tasks[{index}]");
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::InvalidField {
            path: path.clone(),
            reason: "task must be a mapping".into(),
        })?;

    let id = obj
        .get("id")
        .ok_or_else(|| ValidationError::MissingField(format!("{path}.id")))?
        .as_str()
        .ok_or_else(|| ValidationError::InvalidField {
            path: format!("{path}.id"),
            reason: "must be a string".into(),
        })?
        .to_string();
    if id.is_empty() {
        return Err(ValidationError::InvalidField {
            path: format!("{path}.id"),
            reason: "must not be empty".into(),
        });
    }

    let task_type = obj
        .get("type")
        .ok_or_else(|| ValidationError::MissingField(format!("{path}.type")))?
        .as_str()
        .ok_or_else(|| ValidationError::InvalidField {
            path: format!("{path}.type"),
            reason: "must be a string".into(),
        })?
        .to_string();

    let depends_on = match obj.get("depends_on") {
        None | Some(Value::Null) => vec![],
        Some(raw) => {
            let list = raw
                .as_array()
                .ok_or_else(|| ValidationError::InvalidField {
                    path: format!("{path}.depends_on"),
                    reason: "must be a sequence of task ids".into(),
                })?;
            let mut deps = Vec::with_capacity(list.len());
            for dep in list {
                let dep = dep.as_str().ok_or_else(|| ValidationError::InvalidField {
                    path: format!("{path}.depends_on"),
                    reason: "dependencies must be strings".into(),
                })?;
                deps.push(dep.to_string());
            }
            deps
        }
    };

    let data_classification = match obj.get("data_classification") {
        None | Some(Value::Null) => DataClassification::default(),
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|_| {
            ValidationError::InvalidField {
                path: format!("{path}.data_classification"),
                reason: format!("must be one of public, pii, phi; got {raw}"),
            }
        })?,
    };

    let config = match obj.get("config") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(raw) => {
            if !raw.is_object() {
                return Err(ValidationError::InvalidField {
                    path: format!("{path}.config"),
                    reason: "must be a mapping".into(),
                });
            }
            raw.clone()
        }
    };

    Ok(TaskDefinition {
        id,
        task_type,
        depends_on,
        data_classification,
        config,
    })
}

fn parse_retry_policy(raw: &Value) -> Result<RetryPolicy, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::InvalidRetryPolicy("must be a mapping".into()))?;

    let defaults = RetryPolicy::default();

    let max_attempts = match obj.get("max_attempts") {
        None => defaults.max_attempts,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                ValidationError::InvalidRetryPolicy(format!(
                    "max_attempts must be a positive integer, got {v}"
                ))
            })?,
    };

    let delay_seconds = match obj.get("delay_seconds") {
        None => defaults.delay_seconds,
        Some(v) => v.as_f64().ok_or_else(|| {
            ValidationError::InvalidRetryPolicy(format!(
                "delay_seconds must be a number, got {v}"
            ))
        })?,
    };

    let exponential_backoff = match obj.get("exponential_backoff") {
        None => defaults.exponential_backoff,
        Some(v) => v.as_bool().ok_or_else(|| {
            ValidationError::InvalidRetryPolicy(format!(
                "exponential_backoff must be a boolean, got {v}"
            ))
        })?,
    };

    let jitter_fraction = match obj.get("jitter_fraction") {
        None => defaults.jitter_fraction,
        Some(v) => v.as_f64().ok_or_else(|| {
            ValidationError::InvalidRetryPolicy(format!(
                "jitter_fraction must be a number, got {v}"
            ))
        })?,
    };

    Ok(RetryPolicy {
        max_attempts,
        delay_seconds,
        exponential_backoff,
        jitter_fraction,
    })
}

fn require_string(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, ValidationError> {
    let value = obj
        .get(key)
        .ok_or_else(|| ValidationError::MissingField(key.to_string()))?;
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ValidationError::InvalidField {
            path: key.to_string(),
            reason: "must be a non-empty string".into(),
        })
}
