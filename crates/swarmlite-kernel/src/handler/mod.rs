//! Task handler interface: the contract between the kernel and concrete
//! task implementations (HTTP calls, LLM invocations, database queries,
//! Python-function dispatch, ...).
//!
//! Handlers never panic or throw across the kernel boundary; every failure
//! comes back as a typed [`HandlerError`] marked transient or permanent.

mod registry;

pub use registry::{HandlerRegistry, RegistryError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failure classes a handler can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// Retryable per the workflow's retry policy
    Transient,

    /// Skips remaining retries and fails the task immediately
    Permanent,
}

/// Error returned by a handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Create a permanent (non-retryable) error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == HandlerErrorKind::Transient
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Execution context handed to `execute` and `compensate`
///
/// Carries identity, attempt information, and the cancellation token the
/// scheduler uses for stop requests. Handlers are expected to observe the
/// token and return promptly once it fires.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Unique id for this specific invocation
    pub invocation_id: Uuid,

    pub workflow_id: String,
    pub task_id: String,

    /// 1-based attempt number for this invocation
    pub attempt: u32,

    /// Attempt ceiling from the workflow's retry policy
    pub max_attempts: u32,

    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            invocation_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            attempt,
            max_attempts,
            cancellation,
        }
    }

    /// Token fired when the workflow is stopped
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether a failure of this invocation would exhaust the retry policy
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A named, registered task implementation
///
/// `execute` must be effectively idempotent within a single
/// `(workflow_id, task_id, attempt)`: the kernel guarantees at most one
/// concurrent invocation per task but cannot guarantee exactly-once
/// delivery across process restarts, so a lost attempt is replayed.
///
/// # Example
///
/// ```ignore
/// struct ChargeCard;
///
/// #[async_trait]
/// impl TaskHandler for ChargeCard {
///     async fn execute(
///         &self,
///         ctx: &TaskContext,
///         params: &serde_json::Value,
///     ) -> Result<serde_json::Value, HandlerError> {
///         let amount = params["amount_cents"].as_u64()
///             .ok_or_else(|| HandlerError::permanent("missing amount_cents"))?;
///         // Charge, keyed by ctx.invocation_id for idempotency...
///         Ok(json!({ "charged": amount }))
///     }
///
///     async fn compensate(
///         &self,
///         _ctx: &TaskContext,
///         params: &serde_json::Value,
///     ) -> Result<(), HandlerError> {
///         // Refund...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Perform the task's work
    async fn execute(
        &self,
        ctx: &TaskContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;

    /// Semantically undo a previously successful `execute`
    ///
    /// Only invoked for tasks with a registered compensation handler; the
    /// default refuses so that an unimplemented rollback is visible in the
    /// audit trail rather than silently swallowed.
    async fn compensate(
        &self,
        ctx: &TaskContext,
        params: &serde_json::Value,
    ) -> Result<(), HandlerError> {
        let _ = params;
        Err(HandlerError::permanent(format!(
            "handler for task {} does not implement compensation",
            ctx.task_id
        )))
    }
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TaskHandler")
    }
}
