//! The dispatch loop: dependency-respecting parallel execution with retry,
//! compensation, stop handling, and durable state transitions.
//!
//! One scheduler instance drives one workflow. Task invocations run on the
//! process-wide worker pool (a semaphore of `P` permits); completions and
//! retry timers are multiplexed through `FuturesUnordered`. Every state
//! transition goes through compare-and-set against the store before the
//! local mirror is updated, which makes concurrent schedulers for the same
//! workflow safe and resume idempotent.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::audit::{AuditEntry, AuditError, AuditEvent, AuditRecord};
use crate::governance::{Decision, GovernanceContext};
use crate::handler::{HandlerError, TaskContext};
use crate::persistence::{StoreError, TaskRecord};
use crate::workflow::{Task, TaskStatus, Workflow, WorkflowStatus};

use super::compensation;
use super::{EngineError, Shared};

/// Completion of one task invocation
pub(super) struct TaskCompletion {
    pub(super) task_id: String,
    pub(super) result: Result<serde_json::Value, HandlerError>,
}

/// Cooperative driver for a single workflow
pub(crate) struct Scheduler {
    pub(super) shared: Arc<Shared>,
    stop: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(shared: Arc<Shared>, stop: CancellationToken) -> Self {
        Self { shared, stop }
    }

    /// Drive the workflow to a terminal status
    #[instrument(skip(self, workflow, context), fields(workflow_id = %workflow.workflow_id))]
    pub(crate) async fn run(
        &self,
        mut workflow: Workflow,
        context: GovernanceContext,
    ) -> Result<WorkflowStatus, EngineError> {
        let workflow_id = workflow.workflow_id.clone();

        if workflow.status == WorkflowStatus::Pending {
            workflow.status = WorkflowStatus::Running;
            workflow.updated_at = Utc::now();
            self.persist_workflow_status(&workflow).await?;
            self.append_audit(AuditEntry::workflow(
                &workflow_id,
                AuditEvent::WorkflowStarted,
                Some(WorkflowStatus::Pending),
                Some(WorkflowStatus::Running),
            ))
            .await?;
            info!(%workflow_id, "workflow started");
        }

        let mut running: FuturesUnordered<BoxFuture<'static, TaskCompletion>> =
            FuturesUnordered::new();
        let mut retry_timers: FuturesUnordered<BoxFuture<'static, String>> =
            FuturesUnordered::new();
        let mut waiting_retry: HashSet<String> = HashSet::new();
        let mut stopping = false;

        loop {
            if !stopping {
                self.promote_and_skip(&mut workflow).await?;
                self.dispatch_ready(&mut workflow, &context, &waiting_retry, &mut running)
                    .await?;
            }

            if running.is_empty() && waiting_retry.is_empty() {
                if stopping {
                    return self.finalize_stopped(&mut workflow).await;
                }
                if workflow.tasks.values().all(|t| t.status.is_settled()) {
                    let any_failed = workflow
                        .tasks
                        .values()
                        .any(|t| t.status == TaskStatus::Failed);
                    return if any_failed {
                        self.finalize_failed(&mut workflow).await
                    } else {
                        self.finalize_success(&mut workflow).await
                    };
                }
                let has_ready = workflow
                    .tasks
                    .values()
                    .any(|t| t.status == TaskStatus::Ready);
                if has_ready {
                    // The shared pool is saturated by other workflows; wait
                    // for a slot, then re-dispatch.
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            stopping = true;
                        }
                        permit = self.shared.pool.acquire() => {
                            if let Ok(permit) = permit {
                                drop(permit);
                            }
                        }
                    }
                } else {
                    // A concurrent scheduler owns the in-flight work for
                    // this workflow; watch the store for its progress.
                    tokio::time::sleep(self.shared.config.store_retry_base_delay).await;
                    self.sync_all_tasks(&mut workflow).await?;
                }
                continue;
            }

            tokio::select! {
                _ = self.stop.cancelled(), if !stopping => {
                    info!(%workflow_id, "stop requested; cancelling pending retries");
                    stopping = true;
                    retry_timers = FuturesUnordered::new();
                    waiting_retry.clear();
                }
                Some(completion) = running.next() => {
                    self.apply_completion(
                        &mut workflow,
                        completion,
                        stopping,
                        &mut retry_timers,
                        &mut waiting_retry,
                    )
                    .await?;
                }
                Some(task_id) = retry_timers.next() => {
                    debug!(%workflow_id, %task_id, "retry delay elapsed");
                    waiting_retry.remove(&task_id);
                }
            }
        }
    }

    /// Skip descendants of failures, then promote tasks whose dependencies
    /// all succeeded. Recomputed whenever any task transitions.
    async fn promote_and_skip(&self, workflow: &mut Workflow) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();

        loop {
            let to_skip: Vec<(String, TaskStatus)> = workflow
                .tasks
                .values()
                .filter(|task| {
                    matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                        && task.depends_on.iter().any(|dep| {
                            matches!(
                                workflow.tasks.get(dep).map(|d| d.status),
                                Some(TaskStatus::Failed) | Some(TaskStatus::Skipped)
                            )
                        })
                })
                .map(|task| (task.task_id.clone(), task.status))
                .collect();

            if to_skip.is_empty() {
                break;
            }

            for (task_id, from) in to_skip {
                if !self
                    .cas_or_sync(workflow, &task_id, from, TaskStatus::Skipped)
                    .await?
                {
                    continue;
                }
                let record = match workflow.tasks.get_mut(&task_id) {
                    Some(task) => {
                        task.status = TaskStatus::Skipped;
                        task.finished_at = Some(Utc::now());
                        TaskRecord::from_task(&workflow_id, task)
                    }
                    None => continue,
                };
                self.put_task(&record).await?;
                self.append_audit(AuditEntry::transition(
                    &workflow_id,
                    &task_id,
                    from,
                    TaskStatus::Skipped,
                ))
                .await?;
                debug!(%workflow_id, %task_id, "task skipped (failed ancestor)");
            }
        }

        let to_promote: Vec<String> = workflow
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task.depends_on.iter().all(|dep| {
                        workflow.tasks.get(dep).map(|d| d.status)
                            == Some(TaskStatus::Success)
                    })
            })
            .map(|task| task.task_id.clone())
            .collect();

        for task_id in to_promote {
            if !self
                .cas_or_sync(workflow, &task_id, TaskStatus::Pending, TaskStatus::Ready)
                .await?
            {
                continue;
            }
            if let Some(task) = workflow.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Ready;
            }
            self.append_audit(AuditEntry::transition(
                &workflow_id,
                &task_id,
                TaskStatus::Pending,
                TaskStatus::Ready,
            ))
            .await?;
        }

        Ok(())
    }

    /// Dispatch ready tasks while pool capacity allows, in task-id order
    async fn dispatch_ready(
        &self,
        workflow: &mut Workflow,
        context: &GovernanceContext,
        waiting_retry: &HashSet<String>,
        running: &mut FuturesUnordered<BoxFuture<'static, TaskCompletion>>,
    ) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();

        let ready_ids: Vec<String> = workflow
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Ready && !waiting_retry.contains(&task.task_id)
            })
            .map(|task| task.task_id.clone())
            .collect();

        for task_id in ready_ids {
            let Ok(permit) = Arc::clone(&self.shared.pool).try_acquire_owned() else {
                break;
            };

            // Idempotent resume: a previous process may already have
            // finished this task.
            if let Some(stored) = self.get_task(&workflow_id, &task_id).await? {
                if stored.status == TaskStatus::Success {
                    debug!(%workflow_id, %task_id, "task already succeeded; not re-dispatching");
                    if let Some(task) = workflow.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Success;
                        task.attempt = stored.attempt;
                        task.finished_at = stored.finished_at;
                    }
                    continue;
                }
            }

            let decision = match workflow.tasks.get(&task_id) {
                Some(task) => self.shared.gate.check(task, context),
                None => continue,
            };
            if let Decision::Deny(reason) = decision {
                drop(permit);
                self.deny_task(workflow, &task_id, reason).await?;
                continue;
            }

            if !self
                .cas_or_sync(workflow, &task_id, TaskStatus::Ready, TaskStatus::Running)
                .await?
            {
                continue;
            }

            let (record, task_snapshot) = match workflow.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.attempt += 1;
                    task.status = TaskStatus::Running;
                    task.started_at = Some(Utc::now());
                    (TaskRecord::from_task(&workflow_id, task), task.clone())
                }
                None => continue,
            };
            self.put_task(&record).await?;
            self.append_audit(AuditEntry::transition(
                &workflow_id,
                &task_id,
                TaskStatus::Ready,
                TaskStatus::Running,
            ))
            .await?;

            info!(
                %workflow_id,
                %task_id,
                attempt = task_snapshot.attempt,
                "dispatching task"
            );
            running.push(self.spawn_task(workflow, &task_snapshot, permit));
        }

        Ok(())
    }

    /// Run one handler invocation on the pool, with timeout and
    /// cancellation wired through
    fn spawn_task(
        &self,
        workflow: &Workflow,
        task: &Task,
        permit: OwnedSemaphorePermit,
    ) -> BoxFuture<'static, TaskCompletion> {
        let task_id = task.task_id.clone();
        let handler = self.shared.registry.resolve(task);
        let params = task.params();
        let timeout = task.timeout().or(self.shared.config.default_task_timeout);
        let ctx = TaskContext::new(
            &workflow.workflow_id,
            &task_id,
            task.attempt,
            workflow.retry_policy.max_attempts,
            self.stop.child_token(),
        );

        let join_task_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let result = match handler {
                Ok(handler) => {
                    let exec = handler.execute(&ctx, &params);
                    match timeout {
                        Some(limit) => match tokio::time::timeout(limit, exec).await {
                            Ok(result) => result,
                            Err(_) => Err(HandlerError::transient(format!(
                                "task timed out after {limit:?}"
                            ))),
                        },
                        None => exec.await,
                    }
                }
                Err(missing) => Err(HandlerError::permanent(missing.to_string())),
            };
            drop(permit);
            TaskCompletion { task_id, result }
        });

        async move {
            match handle.await {
                Ok(completion) => completion,
                Err(join_error) => TaskCompletion {
                    task_id: join_task_id,
                    result: Err(HandlerError::permanent(format!(
                        "task execution panicked: {join_error}"
                    ))),
                },
            }
        }
        .boxed()
    }

    /// Apply a handler result: success, retry with delay, or failure
    async fn apply_completion(
        &self,
        workflow: &mut Workflow,
        completion: TaskCompletion,
        stopping: bool,
        retry_timers: &mut FuturesUnordered<BoxFuture<'static, String>>,
        waiting_retry: &mut HashSet<String>,
    ) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();
        let TaskCompletion { task_id, result } = completion;

        let attempt = workflow
            .tasks
            .get(&task_id)
            .map(|t| t.attempt)
            .unwrap_or(0);
        let policy = workflow.retry_policy.clone();

        match result {
            Ok(_output) => {
                self.cas_or_sync(workflow, &task_id, TaskStatus::Running, TaskStatus::Success)
                    .await?;
                let record = match workflow.tasks.get_mut(&task_id) {
                    Some(task) => {
                        task.status = TaskStatus::Success;
                        task.finished_at = Some(Utc::now());
                        task.last_error = None;
                        TaskRecord::from_task(&workflow_id, task)
                    }
                    None => return Ok(()),
                };
                self.put_task(&record).await?;
                self.append_audit(AuditEntry::transition(
                    &workflow_id,
                    &task_id,
                    TaskStatus::Running,
                    TaskStatus::Success,
                ))
                .await?;
                info!(%workflow_id, %task_id, attempt, "task succeeded");
            }
            Err(handler_error) => {
                let will_retry =
                    handler_error.is_transient() && !stopping && policy.should_retry(attempt);

                if will_retry {
                    self.cas_or_sync(workflow, &task_id, TaskStatus::Running, TaskStatus::Ready)
                        .await?;
                    let record = match workflow.tasks.get_mut(&task_id) {
                        Some(task) => {
                            task.status = TaskStatus::Ready;
                            task.last_error = Some(handler_error.message.clone());
                            TaskRecord::from_task(&workflow_id, task)
                        }
                        None => return Ok(()),
                    };
                    self.put_task(&record).await?;
                    self.append_audit(AuditEntry::transition(
                        &workflow_id,
                        &task_id,
                        TaskStatus::Running,
                        TaskStatus::Ready,
                    ))
                    .await?;

                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        %workflow_id,
                        %task_id,
                        attempt,
                        error = %handler_error,
                        ?delay,
                        "transient failure; retry scheduled"
                    );
                    waiting_retry.insert(task_id.clone());
                    retry_timers.push(
                        async move {
                            tokio::time::sleep(delay).await;
                            task_id
                        }
                        .boxed(),
                    );
                } else {
                    self.cas_or_sync(workflow, &task_id, TaskStatus::Running, TaskStatus::Failed)
                        .await?;
                    let record = match workflow.tasks.get_mut(&task_id) {
                        Some(task) => {
                            task.status = TaskStatus::Failed;
                            task.last_error = Some(handler_error.message.clone());
                            task.finished_at = Some(Utc::now());
                            TaskRecord::from_task(&workflow_id, task)
                        }
                        None => return Ok(()),
                    };
                    self.put_task(&record).await?;
                    self.append_audit(AuditEntry::transition(
                        &workflow_id,
                        &task_id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                    ))
                    .await?;
                    error!(
                        %workflow_id,
                        %task_id,
                        attempt,
                        error = %handler_error,
                        "task failed"
                    );
                }
            }
        }

        Ok(())
    }

    /// Governance denial: terminal for the task, never retried
    async fn deny_task(
        &self,
        workflow: &mut Workflow,
        task_id: &str,
        reason: String,
    ) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();
        warn!(%workflow_id, %task_id, %reason, "governance denied task");

        self.append_audit(AuditEntry::task(
            &workflow_id,
            task_id,
            AuditEvent::GovernanceDeny,
            Some(TaskStatus::Ready),
            Some(TaskStatus::Failed),
        ))
        .await?;

        if !self
            .cas_or_sync(workflow, task_id, TaskStatus::Ready, TaskStatus::Failed)
            .await?
        {
            return Ok(());
        }
        let record = match workflow.tasks.get_mut(task_id) {
            Some(task) => {
                task.status = TaskStatus::Failed;
                task.last_error = Some(format!("GovernanceDenied({reason})"));
                task.finished_at = Some(Utc::now());
                TaskRecord::from_task(&workflow_id, task)
            }
            None => return Ok(()),
        };
        self.put_task(&record).await?;
        self.append_audit(AuditEntry::transition(
            &workflow_id,
            task_id,
            TaskStatus::Ready,
            TaskStatus::Failed,
        ))
        .await?;
        Ok(())
    }

    async fn finalize_success(
        &self,
        workflow: &mut Workflow,
    ) -> Result<WorkflowStatus, EngineError> {
        workflow.status = WorkflowStatus::Success;
        workflow.updated_at = Utc::now();
        self.persist_workflow_status(workflow).await?;
        self.append_audit(AuditEntry::workflow(
            &workflow.workflow_id,
            AuditEvent::WorkflowTerminal,
            Some(WorkflowStatus::Running),
            Some(WorkflowStatus::Success),
        ))
        .await?;
        info!(workflow_id = %workflow.workflow_id, "workflow succeeded");
        Ok(WorkflowStatus::Success)
    }

    /// Terminal failure: persist the status, then run compensation over
    /// succeeded tasks in reverse topological order
    async fn finalize_failed(
        &self,
        workflow: &mut Workflow,
    ) -> Result<WorkflowStatus, EngineError> {
        workflow.last_error = workflow
            .tasks
            .values()
            .find(|t| t.status == TaskStatus::Failed)
            .map(|t| {
                format!(
                    "task {} failed: {}",
                    t.task_id,
                    t.last_error.as_deref().unwrap_or("unknown error")
                )
            });
        workflow.status = WorkflowStatus::Failed;
        workflow.updated_at = Utc::now();
        self.persist_workflow_status(workflow).await?;
        self.append_audit(AuditEntry::workflow(
            &workflow.workflow_id,
            AuditEvent::WorkflowTerminal,
            Some(WorkflowStatus::Running),
            Some(WorkflowStatus::Failed),
        ))
        .await?;
        error!(
            workflow_id = %workflow.workflow_id,
            error = workflow.last_error.as_deref().unwrap_or(""),
            "workflow failed; starting compensation"
        );

        compensation::run_compensation(self, workflow).await?;
        Ok(WorkflowStatus::Failed)
    }

    /// Stop: settle undispatched tasks as skipped and mark the workflow
    /// stopped; in-flight results were already recorded
    async fn finalize_stopped(
        &self,
        workflow: &mut Workflow,
    ) -> Result<WorkflowStatus, EngineError> {
        let workflow_id = workflow.workflow_id.clone();

        let unsettled: Vec<(String, TaskStatus)> = workflow
            .tasks
            .values()
            .filter(|t| !t.status.is_settled())
            .map(|t| (t.task_id.clone(), t.status))
            .collect();

        for (task_id, from) in unsettled {
            if !self
                .cas_or_sync(workflow, &task_id, from, TaskStatus::Skipped)
                .await?
            {
                continue;
            }
            let record = match workflow.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.status = TaskStatus::Skipped;
                    task.finished_at = Some(Utc::now());
                    TaskRecord::from_task(&workflow_id, task)
                }
                None => continue,
            };
            self.put_task(&record).await?;
            self.append_audit(AuditEntry::transition(
                &workflow_id,
                &task_id,
                from,
                TaskStatus::Skipped,
            ))
            .await?;
        }

        workflow.status = WorkflowStatus::Stopped;
        workflow.updated_at = Utc::now();
        self.persist_workflow_status(workflow).await?;
        self.append_audit(AuditEntry::workflow(
            &workflow_id,
            AuditEvent::WorkflowTerminal,
            Some(WorkflowStatus::Running),
            Some(WorkflowStatus::Stopped),
        ))
        .await?;
        info!(%workflow_id, "workflow stopped");
        Ok(WorkflowStatus::Stopped)
    }

    // =========================================================================
    // Store access with bounded retry
    // =========================================================================

    /// Run a store operation, retrying transient store failures with
    /// exponential backoff up to the configured ceiling
    async fn retry_store<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.shared.config.store_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay =
                        self.shared.config.store_retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(%label, %error, attempt, ?delay, "store operation failed; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) if error.is_retryable() => {
                    error!(%label, %error, attempts = max_attempts, "store unavailable; abandoning scheduler");
                    return Err(EngineError::StoreUnavailable {
                        attempts: max_attempts,
                        source: error,
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// CAS a task's status; on a lost race, re-read the store and sync the
    /// local mirror so the loser re-evaluates
    pub(super) async fn cas_or_sync(
        &self,
        workflow: &mut Workflow,
        task_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool, EngineError> {
        let workflow_id = workflow.workflow_id.clone();
        let won = self
            .retry_store("cas_task_status", || {
                self.shared
                    .store
                    .cas_task_status(&workflow_id, task_id, expected, new)
            })
            .await?;

        if !won {
            warn!(%workflow_id, %task_id, %expected, %new, "compare-and-set lost; syncing from store");
            if let Some(stored) = self.get_task(&workflow_id, task_id).await? {
                if let Some(task) = workflow.tasks.get_mut(task_id) {
                    task.status = stored.status;
                    task.attempt = stored.attempt;
                    task.last_error = stored.last_error;
                    task.started_at = stored.started_at;
                    task.finished_at = stored.finished_at;
                }
            }
        }
        Ok(won)
    }

    pub(super) async fn put_task(&self, record: &TaskRecord) -> Result<(), EngineError> {
        self.retry_store("put_task", || self.shared.store.put_task(record))
            .await
    }

    /// Refresh the local mirror from the store (used when a concurrent
    /// scheduler is driving the same workflow)
    async fn sync_all_tasks(&self, workflow: &mut Workflow) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();
        let stored = self
            .retry_store("list_tasks", || self.shared.store.list_tasks(&workflow_id))
            .await?;
        for record in stored {
            if let Some(task) = workflow.tasks.get_mut(&record.task_id) {
                task.status = record.status;
                task.attempt = record.attempt;
                task.last_error = record.last_error;
                task.started_at = record.started_at;
                task.finished_at = record.finished_at;
            }
        }
        Ok(())
    }

    async fn get_task(
        &self,
        workflow_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, EngineError> {
        self.retry_store("get_task", || {
            self.shared.store.get_task(workflow_id, task_id)
        })
        .await
    }

    /// Read-modify-write the workflow row's mutable columns
    async fn persist_workflow_status(&self, workflow: &Workflow) -> Result<(), EngineError> {
        let workflow_id = workflow.workflow_id.clone();
        let mut record = self
            .retry_store("get_workflow", || {
                self.shared.store.get_workflow(&workflow_id)
            })
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))?;

        record.status = workflow.status;
        record.last_error = workflow.last_error.clone();
        record.updated_at = workflow.updated_at;

        self.retry_store("put_workflow", || self.shared.store.put_workflow(&record))
            .await
    }

    pub(super) async fn append_audit(
        &self,
        entry: AuditEntry,
    ) -> Result<AuditRecord, EngineError> {
        let max_attempts = self.shared.config.store_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.audit.append(entry.clone()).await {
                Ok(record) => return Ok(record),
                Err(AuditError::Database(message)) if attempt < max_attempts => {
                    let delay =
                        self.shared.config.store_retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(error = %message, attempt, ?delay, "audit append failed; backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
