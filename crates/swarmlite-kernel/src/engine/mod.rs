//! The orchestration engine: submission API and per-workflow schedulers.
//!
//! [`WorkflowEngine`] is the only surface the REST layer may invoke:
//! `submit`, `status`, `stop`, plus `resume_in_flight` at startup. Each
//! accepted workflow gets its own cooperative scheduler task; all of them
//! share one bounded worker pool.

mod compensation;
mod recovery;
mod scheduler;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::audit::{AuditEntry, AuditError, AuditEvent, AuditLog, InMemoryAuditLog};
use crate::config::{ConfigError, KernelConfig};
use crate::definition::{parse_definition, validate, ValidationError};
use crate::governance::{GovernanceContext, GovernanceGate};
use crate::handler::HandlerRegistry;
use crate::persistence::{
    FieldCipher, InMemoryStateStore, StateStore, StoreError, TaskRecord, WorkflowRecord,
};
use crate::signing::HmacSigner;
use crate::workflow::{
    TaskSnapshot, Workflow, WorkflowSnapshot, WorkflowStatus,
};

use recovery::Recovery;
use scheduler::Scheduler;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition rejected before any state was written
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Audit log error
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The workflow id exists under a different idempotency key
    #[error("workflow {0} already exists with a different idempotency key")]
    IdempotencyConflict(String),

    /// Store stayed unavailable past the retry ceiling; the scheduler
    /// exited, leaving persisted state consistent for later resume
    #[error("store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// Collaborators shared by every scheduler in the process
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) audit: Arc<dyn AuditLog>,
    pub(crate) gate: Arc<dyn GovernanceGate>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) config: KernelConfig,
    pub(crate) pool: Arc<Semaphore>,
}

struct WorkflowHandle {
    stop: CancellationToken,
}

/// Single-node workflow orchestration engine
///
/// # Example
///
/// ```ignore
/// let config = KernelConfig::from_env()?;
/// let engine = WorkflowEngine::in_memory(config, Arc::new(AllowAll), registry)?;
///
/// let workflow_id = engine
///     .submit(definition_bytes, Some("req-42".into()), context)
///     .await?;
/// let snapshot = engine.status(&workflow_id).await?;
/// ```
pub struct WorkflowEngine {
    shared: Arc<Shared>,
    running: Arc<DashMap<String, WorkflowHandle>>,
}

impl WorkflowEngine {
    /// Build an engine around injected collaborators
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn StateStore>,
        audit: Arc<dyn AuditLog>,
        gate: Arc<dyn GovernanceGate>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.parallelism));
        Self {
            shared: Arc::new(Shared {
                store,
                audit,
                gate,
                registry,
                config,
                pool,
            }),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Build an engine over the in-memory store and audit log
    pub fn in_memory(
        config: KernelConfig,
        gate: Arc<dyn GovernanceGate>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, ConfigError> {
        let signer = HmacSigner::new(config.audit_secret.clone());
        let cipher = match &config.db_encryption_key {
            Some(key) => Some(FieldCipher::new(key).map_err(|e| ConfigError::Invalid {
                var: "DB_ENCRYPTION_KEY",
                reason: e.to_string(),
            })?),
            None => None,
        };

        let store = Arc::new(InMemoryStateStore::new(signer.clone(), cipher));
        let audit = Arc::new(InMemoryAuditLog::new(signer));
        Ok(Self::new(config, store, audit, gate, registry))
    }

    /// Submit a workflow definition
    ///
    /// Validates the definition, persists initial state, and spawns the
    /// scheduler. A duplicate `(workflow_id, idempotency_key)` submission
    /// returns the existing workflow's id without starting anything; if the
    /// duplicate's definition differs from the stored one, an
    /// `IDEMPOTENT_REPLAY` audit record notes the divergence.
    #[instrument(skip(self, definition_bytes, context))]
    pub async fn submit(
        &self,
        definition_bytes: &[u8],
        idempotency_key: Option<String>,
        context: GovernanceContext,
    ) -> Result<String, EngineError> {
        let document: serde_json::Value = serde_json::from_slice(definition_bytes)
            .map_err(|e| ValidationError::InvalidDocument(e.to_string()))?;
        self.submit_document(document, idempotency_key, context)
            .await
    }

    /// Submit an already-normalized definition tree
    pub async fn submit_document(
        &self,
        document: serde_json::Value,
        idempotency_key: Option<String>,
        context: GovernanceContext,
    ) -> Result<String, EngineError> {
        let definition = parse_definition(&document)?;
        let workflow = validate(definition, idempotency_key.clone())?;
        let workflow_id = workflow.workflow_id.clone();

        if let Some(existing) = self.shared.store.get_workflow(&workflow_id).await? {
            if existing.idempotency_key == idempotency_key {
                if existing.definition != document {
                    warn!(
                        %workflow_id,
                        "idempotent resubmission carries a different definition"
                    );
                    self.shared
                        .audit
                        .append(AuditEntry::workflow(
                            &workflow_id,
                            AuditEvent::IdempotentReplay,
                            None,
                            None,
                        ))
                        .await?;
                }
                info!(%workflow_id, "returning existing workflow for idempotent submission");
                return Ok(workflow_id);
            }
            return Err(EngineError::IdempotencyConflict(workflow_id));
        }

        let record = WorkflowRecord::from_workflow(&workflow, document, context.clone());
        self.shared.store.put_workflow(&record).await?;
        self.shared
            .audit
            .append(AuditEntry::workflow(
                &workflow_id,
                AuditEvent::WorkflowCreated,
                None,
                Some(WorkflowStatus::Pending),
            ))
            .await?;

        for task in workflow.tasks.values() {
            self.shared
                .store
                .put_task(&TaskRecord::from_task(&workflow_id, task))
                .await?;
        }

        info!(%workflow_id, tasks = workflow.tasks.len(), "workflow accepted");
        self.spawn_scheduler(workflow, context);
        Ok(workflow_id)
    }

    /// Point-in-time status assembled from the state store
    pub async fn status(&self, workflow_id: &str) -> Result<WorkflowSnapshot, EngineError> {
        let record = self
            .shared
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let tasks = self.shared.store.list_tasks(workflow_id).await?;
        Ok(WorkflowSnapshot {
            workflow_id: record.workflow_id,
            status: record.status,
            last_error: record.last_error,
            tasks: tasks
                .into_iter()
                .map(|t| TaskSnapshot {
                    task_id: t.task_id,
                    status: t.status,
                    attempt: t.attempt,
                    last_error: t.last_error,
                    started_at: t.started_at,
                    finished_at: t.finished_at,
                })
                .collect(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Request a cooperative stop
    ///
    /// With a live scheduler this cancels pending retry timers and signals
    /// in-flight handlers; their final results are recorded but trigger no
    /// further dispatch. Without one (e.g. after a restart that has not
    /// resumed), the workflow is settled directly in the store.
    #[instrument(skip(self))]
    pub async fn stop(&self, workflow_id: &str) -> Result<(), EngineError> {
        if let Some(handle) = self.running.get(workflow_id) {
            info!(%workflow_id, "stop requested");
            handle.stop.cancel();
            return Ok(());
        }

        let mut record = self
            .shared
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(());
        }

        for mut task in self.shared.store.list_tasks(workflow_id).await? {
            if !task.status.is_settled() {
                let from = task.status;
                task.status = crate::workflow::TaskStatus::Skipped;
                task.finished_at = Some(chrono::Utc::now());
                self.shared.store.put_task(&task).await?;
                self.shared
                    .audit
                    .append(AuditEntry::transition(
                        workflow_id,
                        &task.task_id,
                        from,
                        task.status,
                    ))
                    .await?;
            }
        }

        let from = record.status;
        record.status = WorkflowStatus::Stopped;
        record.updated_at = chrono::Utc::now();
        self.shared.store.put_workflow(&record).await?;
        self.shared
            .audit
            .append(AuditEntry::workflow(
                workflow_id,
                AuditEvent::WorkflowTerminal,
                Some(from),
                Some(WorkflowStatus::Stopped),
            ))
            .await?;

        info!(%workflow_id, "workflow stopped without a live scheduler");
        Ok(())
    }

    /// Resume in-flight workflows from the store (crash recovery)
    ///
    /// Verifies each workflow's audit chain before touching it; a broken
    /// chain marks the workflow failed with an integrity violation and
    /// quarantines it from further action.
    pub async fn resume_in_flight(&self) -> Result<Vec<String>, EngineError> {
        let recovered = Recovery::new(Arc::clone(&self.shared)).recover().await?;

        let mut resumed = Vec::with_capacity(recovered.len());
        for (workflow, context) in recovered {
            resumed.push(workflow.workflow_id.clone());
            self.spawn_scheduler(workflow, context);
        }

        if !resumed.is_empty() {
            info!(count = resumed.len(), "resumed in-flight workflows");
        }
        Ok(resumed)
    }

    /// Whether a scheduler is currently live for this workflow
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.running.contains_key(workflow_id)
    }

    fn spawn_scheduler(&self, workflow: Workflow, context: GovernanceContext) {
        let stop = CancellationToken::new();
        let workflow_id = workflow.workflow_id.clone();
        self.running.insert(
            workflow_id.clone(),
            WorkflowHandle { stop: stop.clone() },
        );

        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let scheduler = Scheduler::new(shared, stop);
            match scheduler.run(workflow, context).await {
                Ok(status) => info!(%workflow_id, %status, "workflow reached terminal state"),
                Err(error) => {
                    error!(%workflow_id, %error, "scheduler exited; state remains resumable")
                }
            }
            running.remove(&workflow_id);
        });
    }
}
