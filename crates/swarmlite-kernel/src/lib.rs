//! # SwarmLite Orchestration Kernel
//!
//! A single-node workflow engine that executes DAG pipelines of typed
//! tasks with durable state, retry with backoff, compensation-based
//! rollback, idempotent submission, and a tamper-evident audit trail.
//!
//! ## Features
//!
//! - **Validated definitions**: duplicate ids, unresolved dependencies,
//!   and cycles are rejected before any state is written
//! - **Dependency-ordered dispatch**: bounded parallelism over a shared
//!   worker pool, deterministic tie-breaks for reproducible runs
//! - **Retry with backoff**: per-workflow policy with exponential backoff
//!   and jitter; transient and permanent failures are distinguished by the
//!   handler
//! - **Compensation**: on terminal failure, rollback handlers run over
//!   succeeded tasks in reverse topological order
//! - **Signed state**: every persisted row carries an HMAC signature, and
//!   audit records form a per-workflow hash chain
//! - **Crash resume**: in-flight workflows are rehydrated at startup after
//!   their audit chain verifies
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                        │
//! │            (submit / status / stop / resume)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Scheduler (per workflow)                 │
//! │   ready-set → governance → CAS dispatch → retry/compensate  │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                           │
//!                 ▼                           ▼
//! ┌───────────────────────────┐ ┌───────────────────────────────┐
//! │         StateStore        │ │           AuditLog            │
//! │  (signed workflow/task    │ │  (HMAC hash chain per         │
//! │   rows, CAS transitions)  │ │   workflow, append-only)      │
//! └───────────────────────────┘ └───────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use swarmlite_kernel::prelude::*;
//!
//! let config = KernelConfig::from_env()?;
//! let gate = gate_from_config(&config)?;
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("python", "extract_records", Arc::new(ExtractHandler));
//!
//! let engine = WorkflowEngine::in_memory(config, gate, Arc::new(registry))?;
//! engine.resume_in_flight().await?;
//!
//! let workflow_id = engine
//!     .submit(definition_bytes, Some("req-42".into()), context)
//!     .await?;
//! ```

pub mod audit;
pub mod config;
pub mod definition;
pub mod engine;
pub mod governance;
pub mod handler;
pub mod persistence;
pub mod retry;
pub mod signing;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditLog, InMemoryAuditLog};
    pub use crate::config::{ConfigError, KernelConfig};
    pub use crate::definition::{parse_definition, validate, ValidationError};
    pub use crate::engine::{EngineError, WorkflowEngine};
    pub use crate::governance::{
        gate_from_config, AllowAll, Decision, GovernanceContext, GovernanceGate, PolicyGate,
    };
    pub use crate::handler::{
        HandlerError, HandlerRegistry, TaskContext, TaskHandler,
    };
    pub use crate::persistence::{
        InMemoryStateStore, PostgresStateStore, StateStore, StoreError,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::workflow::{
        DataClassification, TaskStatus, WorkflowSnapshot, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use audit::{AuditEntry, AuditEvent, AuditLog, AuditRecord, InMemoryAuditLog};
pub use config::{ConfigError, KernelConfig};
pub use definition::{parse_definition, validate, ValidationError};
pub use engine::{EngineError, WorkflowEngine};
pub use governance::{
    gate_from_config, AllowAll, Decision, GovernanceContext, GovernanceGate, PolicyGate,
};
pub use handler::{HandlerError, HandlerErrorKind, HandlerRegistry, TaskContext, TaskHandler};
pub use persistence::{
    FieldCipher, InMemoryStateStore, PostgresStateStore, StateStore, StoreError, TaskRecord,
    WorkflowRecord,
};
pub use retry::RetryPolicy;
pub use signing::HmacSigner;
pub use workflow::{
    DataClassification, Task, TaskSnapshot, TaskStatus, Workflow, WorkflowSnapshot,
    WorkflowStatus,
};
