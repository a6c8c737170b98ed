//! Compensation: best-effort rollback of succeeded tasks after a terminal
//! workflow failure.
//!
//! Runs in reverse topological order over the tasks that were `Success`
//! at the moment of failure. Tasks without a registered compensation
//! handler keep their `Success` status; the workflow's terminal state is
//! `Failed` regardless of compensation outcomes, and the audit trail
//! records which side effects were and were not undone.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditEvent};
use crate::handler::TaskContext;
use crate::persistence::TaskRecord;
use crate::workflow::{TaskStatus, Workflow};

use super::scheduler::Scheduler;
use super::EngineError;

/// Run compensation handlers for succeeded tasks, newest first.
///
/// Returns the number of successful rollbacks. A failing compensation is
/// recorded and skipped; it never blocks the remaining rollbacks.
pub(super) async fn run_compensation(
    scheduler: &Scheduler,
    workflow: &mut Workflow,
) -> Result<usize, EngineError> {
    let workflow_id = workflow.workflow_id.clone();
    let mut rolled_back = 0;

    let order: Vec<String> = workflow.topo_order.iter().rev().cloned().collect();
    for task_id in order {
        let Some(task) = workflow.tasks.get(&task_id) else {
            continue;
        };
        if task.status != TaskStatus::Success {
            continue;
        }
        let Some(handler_name) = workflow.compensation_handlers.get(&task_id) else {
            debug!(%workflow_id, %task_id, "no compensation handler registered; leaving success in place");
            continue;
        };

        let handler = match scheduler.shared.registry.resolve_compensator(handler_name) {
            Ok(handler) => handler,
            Err(missing) => {
                warn!(%workflow_id, %task_id, error = %missing, "compensation handler unresolvable");
                scheduler
                    .append_audit(AuditEntry::task(
                        &workflow_id,
                        &task_id,
                        AuditEvent::CompensationRun,
                        Some(TaskStatus::Success),
                        Some(TaskStatus::Success),
                    ))
                    .await?;
                continue;
            }
        };

        let ctx = TaskContext::new(
            &workflow_id,
            &task_id,
            task.attempt,
            workflow.retry_policy.max_attempts,
            CancellationToken::new(),
        );
        let params = task.params();

        match handler.compensate(&ctx, &params).await {
            Ok(()) => {
                scheduler
                    .cas_or_sync(workflow, &task_id, TaskStatus::Success, TaskStatus::Rollback)
                    .await?;
                let record = match workflow.tasks.get_mut(&task_id) {
                    Some(task) => {
                        task.status = TaskStatus::Rollback;
                        task.finished_at = Some(Utc::now());
                        TaskRecord::from_task(&workflow_id, task)
                    }
                    None => continue,
                };
                scheduler.put_task(&record).await?;
                scheduler
                    .append_audit(AuditEntry::task(
                        &workflow_id,
                        &task_id,
                        AuditEvent::CompensationRun,
                        Some(TaskStatus::Success),
                        Some(TaskStatus::Rollback),
                    ))
                    .await?;
                info!(%workflow_id, %task_id, "task rolled back");
                rolled_back += 1;
            }
            Err(error) => {
                // Best effort: record and keep going.
                warn!(%workflow_id, %task_id, %error, "compensation failed; continuing");
                let record = match workflow.tasks.get_mut(&task_id) {
                    Some(task) => {
                        task.last_error = Some(format!("compensation failed: {error}"));
                        TaskRecord::from_task(&workflow_id, task)
                    }
                    None => continue,
                };
                scheduler.put_task(&record).await?;
                scheduler
                    .append_audit(AuditEntry::task(
                        &workflow_id,
                        &task_id,
                        AuditEvent::CompensationRun,
                        Some(TaskStatus::Success),
                        Some(TaskStatus::Success),
                    ))
                    .await?;
            }
        }
    }

    Ok(rolled_back)
}
