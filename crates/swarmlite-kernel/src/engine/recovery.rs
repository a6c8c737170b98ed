//! Crash recovery: rehydrate in-flight workflows from the store and hand
//! them back to the scheduler.
//!
//! Each candidate's audit chain is verified first. A broken chain marks
//! the workflow failed with an integrity violation and quarantines it;
//! otherwise tasks that were `Running` when the process died are reset to
//! `Ready` (the lost attempt does not count) and the workflow re-enters
//! the dispatch loop. Succeeded and failed tasks are left untouched, so
//! completed handlers are not re-invoked.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::audit::{AuditEntry, AuditError, AuditEvent};
use crate::definition::{parse_definition, validate};
use crate::governance::GovernanceContext;
use crate::persistence::{TaskRecord, WorkflowRecord};
use crate::workflow::{TaskStatus, Workflow, WorkflowStatus};

use super::{EngineError, Shared};

pub(super) struct Recovery {
    shared: Arc<Shared>,
}

impl Recovery {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Rehydrate every resumable workflow, quarantining integrity failures
    pub(super) async fn recover(
        &self,
    ) -> Result<Vec<(Workflow, GovernanceContext)>, EngineError> {
        let in_flight = self.shared.store.list_in_flight().await?;
        let mut recovered = Vec::new();

        for record in in_flight {
            let workflow_id = record.workflow_id.clone();

            match self.shared.audit.verify_chain(&workflow_id).await {
                Ok(count) => {
                    debug!(%workflow_id, records = count, "audit chain verified");
                }
                Err(AuditError::BrokenChain { seq, reason }) => {
                    error!(
                        %workflow_id,
                        seq,
                        %reason,
                        "audit chain verification failed; quarantining workflow"
                    );
                    self.quarantine(record, seq, &reason).await?;
                    continue;
                }
                Err(other) => return Err(other.into()),
            }

            let workflow = self.rehydrate(&record).await?;
            info!(%workflow_id, "workflow rehydrated for resume");
            recovered.push((workflow, record.context));
        }

        Ok(recovered)
    }

    /// Mark a workflow failed with an integrity violation; no further
    /// action is taken on it
    async fn quarantine(
        &self,
        mut record: WorkflowRecord,
        seq: u64,
        reason: &str,
    ) -> Result<(), EngineError> {
        let from = record.status;
        record.status = WorkflowStatus::Failed;
        record.last_error = Some(format!(
            "IntegrityViolation: audit chain broken at seq {seq}: {reason}"
        ));
        record.updated_at = Utc::now();
        self.shared.store.put_workflow(&record).await?;
        self.shared
            .audit
            .append(AuditEntry::workflow(
                &record.workflow_id,
                AuditEvent::WorkflowTerminal,
                Some(from),
                Some(WorkflowStatus::Failed),
            ))
            .await?;
        Ok(())
    }

    /// Rebuild the runtime workflow from its stored definition and task
    /// rows, resetting lost `Running` attempts to `Ready`
    async fn rehydrate(&self, record: &WorkflowRecord) -> Result<Workflow, EngineError> {
        let definition = parse_definition(&record.definition)?;
        let mut workflow = validate(definition, record.idempotency_key.clone())?;
        workflow.status = record.status;
        workflow.last_error = record.last_error.clone();
        workflow.created_at = record.created_at;
        workflow.updated_at = record.updated_at;

        let workflow_id = record.workflow_id.clone();
        for stored in self.shared.store.list_tasks(&workflow_id).await? {
            let Some(task) = workflow.tasks.get_mut(&stored.task_id) else {
                continue;
            };
            task.status = stored.status;
            task.attempt = stored.attempt;
            task.last_error = stored.last_error;
            task.started_at = stored.started_at;
            task.finished_at = stored.finished_at;

            if stored.status == TaskStatus::Running {
                let reset = self
                    .shared
                    .store
                    .cas_task_status(
                        &workflow_id,
                        &stored.task_id,
                        TaskStatus::Running,
                        TaskStatus::Ready,
                    )
                    .await?;
                if reset {
                    // The in-flight attempt is lost and does not count
                    // toward the retry ceiling.
                    task.status = TaskStatus::Ready;
                    task.attempt = task.attempt.saturating_sub(1);
                    task.started_at = None;
                    let reset_record = TaskRecord::from_task(&workflow_id, task);
                    self.shared.store.put_task(&reset_record).await?;
                    self.shared
                        .audit
                        .append(AuditEntry::transition(
                            &workflow_id,
                            &stored.task_id,
                            TaskStatus::Running,
                            TaskStatus::Ready,
                        ))
                        .await?;
                    debug!(
                        %workflow_id,
                        task_id = %stored.task_id,
                        "reset lost running task to ready"
                    );
                }
            }
        }

        Ok(workflow)
    }
}
