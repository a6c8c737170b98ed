//! Tamper-evident audit trail.
//!
//! Every state transition is appended as a signed record. Per workflow,
//! records form a hash chain: each record's `prev_hash` is the signature of
//! the previous record (a fixed zero hash for the first), and the
//! signature is `HMAC-SHA256(AUDIT_SECRET_KEY, canonical(record without
//! signature))`. Verification is a linear walk; any edit, reorder, or
//! deletion breaks the chain.

mod memory;

pub use memory::InMemoryAuditLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signing::{HmacSigner, ZERO_HASH};
use crate::workflow::{TaskStatus, WorkflowStatus};

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    WorkflowCreated,
    WorkflowStarted,
    TaskTransition,
    WorkflowTerminal,
    CompensationRun,
    GovernanceDeny,
    /// A duplicate idempotent submission arrived with a definition that
    /// differs from the stored one
    IdempotentReplay,
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WorkflowCreated => "WORKFLOW_CREATED",
            Self::WorkflowStarted => "WORKFLOW_STARTED",
            Self::TaskTransition => "TASK_TRANSITION",
            Self::WorkflowTerminal => "WORKFLOW_TERMINAL",
            Self::CompensationRun => "COMPENSATION_RUN",
            Self::GovernanceDeny => "GOVERNANCE_DENY",
            Self::IdempotentReplay => "IDEMPOTENT_REPLAY",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AuditEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WORKFLOW_CREATED" => Ok(Self::WorkflowCreated),
            "WORKFLOW_STARTED" => Ok(Self::WorkflowStarted),
            "TASK_TRANSITION" => Ok(Self::TaskTransition),
            "WORKFLOW_TERMINAL" => Ok(Self::WorkflowTerminal),
            "COMPENSATION_RUN" => Ok(Self::CompensationRun),
            "GOVERNANCE_DENY" => Ok(Self::GovernanceDeny),
            "IDEMPOTENT_REPLAY" => Ok(Self::IdempotentReplay),
            other => Err(format!("unknown audit event: {other}")),
        }
    }
}

/// Unsigned audit input; the log assigns seq, timestamp, chain fields, and
/// the signature on append
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub event: AuditEvent,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
}

impl AuditEntry {
    /// Workflow-level event
    pub fn workflow(
        workflow_id: impl Into<String>,
        event: AuditEvent,
        from: Option<WorkflowStatus>,
        to: Option<WorkflowStatus>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: None,
            event,
            from_state: from.map(|s| s.to_string()),
            to_state: to.map(|s| s.to_string()),
        }
    }

    /// Task status transition
    pub fn transition(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: Some(task_id.into()),
            event: AuditEvent::TaskTransition,
            from_state: Some(from.to_string()),
            to_state: Some(to.to_string()),
        }
    }

    /// Task-level event with explicit states
    pub fn task(
        workflow_id: impl Into<String>,
        task_id: impl Into<String>,
        event: AuditEvent,
        from: Option<TaskStatus>,
        to: Option<TaskStatus>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: Some(task_id.into()),
            event,
            from_state: from.map(|s| s.to_string()),
            to_state: to.map(|s| s.to_string()),
        }
    }
}

/// A signed, chained audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub event: AuditEvent,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub signature: String,
}

/// Errors from audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Chain verification failed; the workflow must be quarantined
    #[error("audit chain broken at seq {seq}: {reason}")]
    BrokenChain { seq: u64, reason: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Canonical byte encoding of a record, signature field excluded
pub fn record_canonical(record: &AuditRecord) -> Vec<u8> {
    let canonical = serde_json::json!([
        record.seq,
        record.workflow_id,
        record.task_id,
        record.event.to_string(),
        record.from_state,
        record.to_state,
        record.timestamp.timestamp_micros(),
        record.prev_hash,
    ]);
    canonical.to_string().into_bytes()
}

/// Sign an otherwise-complete record
pub fn sign_record(signer: &HmacSigner, record: &mut AuditRecord) {
    record.signature = signer.sign(&record_canonical(record));
}

/// Linear walk over one workflow's records in seq order
///
/// Returns the number of verified records.
pub fn verify_records(
    signer: &HmacSigner,
    records: &[AuditRecord],
) -> Result<usize, AuditError> {
    let mut prev_hash = ZERO_HASH;
    for record in records {
        if record.prev_hash != prev_hash {
            return Err(AuditError::BrokenChain {
                seq: record.seq,
                reason: "prev_hash does not match the preceding record".to_string(),
            });
        }
        if !signer.verify(&record_canonical(record), &record.signature) {
            return Err(AuditError::BrokenChain {
                seq: record.seq,
                reason: "signature does not verify".to_string(),
            });
        }
        prev_hash = &record.signature;
    }
    Ok(records.len())
}

/// Append-only signed event log
///
/// Events for a single workflow are totally ordered and chained; the log
/// serializes appends.
#[async_trait]
pub trait AuditLog: Send + Sync + 'static {
    /// Append an entry, returning the signed record
    async fn append(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError>;

    /// All records for a workflow in seq order
    async fn records(&self, workflow_id: &str) -> Result<Vec<AuditRecord>, AuditError>;

    /// Verify the workflow's chain end to end; returns the record count
    async fn verify_chain(&self, workflow_id: &str) -> Result<usize, AuditError>;
}
