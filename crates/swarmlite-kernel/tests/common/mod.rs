//! Shared fixtures for the end-to-end scenario tests: stub handlers, an
//! engine wired to in-memory collaborators, and polling helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use swarmlite_kernel::audit::InMemoryAuditLog;
use swarmlite_kernel::persistence::{FieldCipher, InMemoryStateStore};
use swarmlite_kernel::prelude::*;
use swarmlite_kernel::signing::HmacSigner;
use swarmlite_kernel::{HandlerError, TaskContext, TaskHandler};

pub const AUDIT_SECRET: &[u8] = b"integration-test-audit-secret-key!!";

pub fn test_config() -> KernelConfig {
    KernelConfig::new(AUDIT_SECRET.to_vec()).expect("test audit secret is long enough")
}

/// Engine over in-memory collaborators, returning the store and audit log
/// for direct inspection.
pub fn build_engine(
    registry: HandlerRegistry,
    gate: Arc<dyn GovernanceGate>,
) -> (
    WorkflowEngine,
    Arc<InMemoryStateStore>,
    Arc<InMemoryAuditLog>,
) {
    build_engine_with_config(test_config(), registry, gate)
}

pub fn build_engine_with_config(
    config: KernelConfig,
    registry: HandlerRegistry,
    gate: Arc<dyn GovernanceGate>,
) -> (
    WorkflowEngine,
    Arc<InMemoryStateStore>,
    Arc<InMemoryAuditLog>,
) {
    let signer = HmacSigner::new(config.audit_secret.clone());
    let cipher = FieldCipher::new(b"integration-test-encryption-key!").expect("32-byte key");
    let store = Arc::new(InMemoryStateStore::new(signer.clone(), Some(cipher)));
    let audit = Arc::new(InMemoryAuditLog::new(signer));
    let engine = WorkflowEngine::new(
        config,
        store.clone(),
        audit.clone(),
        gate,
        Arc::new(registry),
    );
    (engine, store, audit)
}

pub fn definition_bytes(document: &Value) -> Vec<u8> {
    serde_json::to_vec(document).expect("definition serializes")
}

/// Poll until the workflow is terminal and its scheduler has fully
/// finished (compensation included), then return the final snapshot.
pub async fn wait_terminal(
    engine: &WorkflowEngine,
    workflow_id: &str,
    timeout: Duration,
) -> WorkflowSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = engine
            .status(workflow_id)
            .await
            .expect("status should be readable");
        if snapshot.status.is_terminal() && !engine.is_running(workflow_id) {
            // Re-read so task states settled by compensation are included.
            return engine
                .status(workflow_id)
                .await
                .expect("status should be readable");
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {workflow_id} did not reach a terminal state (status: {})",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that always succeeds and counts invocations.
pub struct CountingHandler {
    invocations: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _params: &Value,
    ) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true }))
    }
}

/// Handler that sleeps for `delay_ms` (from params, default 0), then
/// succeeds. Returns early with a permanent error if cancelled mid-sleep.
pub struct SleepyHandler {
    invocations: AtomicUsize,
}

impl SleepyHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for SleepyHandler {
    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let delay = params["delay_ms"].as_u64().unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => Ok(json!({ "slept_ms": delay })),
            _ = ctx.cancellation().cancelled() => {
                Err(HandlerError::permanent("cancelled by stop request"))
            }
        }
    }
}

/// Handler that fails transiently `failures` times, then succeeds.
pub struct FlakyHandler {
    remaining_failures: AtomicUsize,
    invocations: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: AtomicUsize::new(failures),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _params: &Value,
    ) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerError::transient("simulated transient failure"));
        }
        Ok(json!({ "ok": true }))
    }
}

/// Handler that always fails with the configured error.
pub struct FailingHandler {
    error: HandlerError,
    invocations: AtomicUsize,
}

impl FailingHandler {
    pub fn permanent(message: &str) -> Arc<Self> {
        Arc::new(Self {
            error: HandlerError::permanent(message),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn transient(message: &str) -> Arc<Self> {
        Arc::new(Self {
            error: HandlerError::transient(message),
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _params: &Value,
    ) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Handler that records `exec:<task_id>` / `comp:<task_id>` events into a
/// shared log; both execute and compensate succeed.
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    pub fn new(events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { events })
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn execute(&self, ctx: &TaskContext, _params: &Value) -> Result<Value, HandlerError> {
        self.events
            .lock()
            .expect("event log lock")
            .push(format!("exec:{}", ctx.task_id));
        Ok(json!({}))
    }

    async fn compensate(
        &self,
        ctx: &TaskContext,
        _params: &Value,
    ) -> Result<(), HandlerError> {
        self.events
            .lock()
            .expect("event log lock")
            .push(format!("comp:{}", ctx.task_id));
        Ok(())
    }
}
