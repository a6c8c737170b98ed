//! Idempotent submission: duplicate `(workflow_id, idempotency_key)`
//! submissions share one workflow and dispatch each handler once.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use swarmlite_kernel::audit::AuditEvent;
use swarmlite_kernel::prelude::*;

fn slow_definition() -> serde_json::Value {
    json!({
        "workflow_id": "wf-idem",
        "tasks": [
            { "id": "a", "type": "test", "config": { "params": { "delay_ms": 200 } } }
        ]
    })
}

#[tokio::test]
async fn overlapping_duplicate_submissions_share_one_workflow() {
    let handler = SleepyHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", handler.clone());

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));
    let bytes = definition_bytes(&slow_definition());
    let key = Some("req-1".to_string());

    let first = engine
        .submit(&bytes, key.clone(), GovernanceContext::anonymous())
        .await
        .expect("first submission accepted");

    // Same id and key while the first is still running: same handle, no
    // second dispatch.
    let second = engine
        .submit(&bytes, key.clone(), GovernanceContext::anonymous())
        .await
        .expect("duplicate submission accepted");
    assert_eq!(first, second);

    let snapshot = wait_terminal(&engine, &first, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, WorkflowStatus::Success);
    assert_eq!(handler.invocations(), 1);

    // Identical definitions: no replay marker on the audit trail.
    let records = audit.records(&first).await.expect("audit readable");
    assert!(!records
        .iter()
        .any(|r| r.event == AuditEvent::IdempotentReplay));
}

#[tokio::test]
async fn terminal_duplicate_returns_the_finished_workflow() {
    let handler = SleepyHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", handler.clone());

    let (engine, _store, _audit) = build_engine(registry, Arc::new(AllowAll));
    let bytes = definition_bytes(&slow_definition());
    let key = Some("req-1".to_string());

    let first = engine
        .submit(&bytes, key.clone(), GovernanceContext::anonymous())
        .await
        .expect("first submission accepted");
    wait_terminal(&engine, &first, Duration::from_secs(5)).await;

    let second = engine
        .submit(&bytes, key, GovernanceContext::anonymous())
        .await
        .expect("duplicate submission accepted");
    assert_eq!(first, second);

    // Still exactly one dispatch; status shows the terminal result.
    assert_eq!(handler.invocations(), 1);
    let snapshot = engine.status(&second).await.expect("status readable");
    assert_eq!(snapshot.status, WorkflowStatus::Success);
}

#[tokio::test]
async fn divergent_duplicate_definition_is_recorded() {
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", CountingHandler::new());

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));
    let key = Some("req-1".to_string());

    let first = engine
        .submit(
            &definition_bytes(&slow_definition()),
            key.clone(),
            GovernanceContext::anonymous(),
        )
        .await
        .expect("first submission accepted");
    wait_terminal(&engine, &first, Duration::from_secs(5)).await;

    // Same id and key, different task configuration.
    let divergent = json!({
        "workflow_id": "wf-idem",
        "tasks": [
            { "id": "a", "type": "test", "config": { "params": { "delay_ms": 999 } } }
        ]
    });
    let second = engine
        .submit(
            &definition_bytes(&divergent),
            key,
            GovernanceContext::anonymous(),
        )
        .await
        .expect("divergent duplicate still returns the original");
    assert_eq!(first, second);

    let records = audit.records(&first).await.expect("audit readable");
    assert!(records
        .iter()
        .any(|r| r.event == AuditEvent::IdempotentReplay));
}

#[tokio::test]
async fn same_workflow_id_with_different_key_conflicts() {
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", CountingHandler::new());

    let (engine, _store, _audit) = build_engine(registry, Arc::new(AllowAll));
    let bytes = definition_bytes(&slow_definition());

    engine
        .submit(&bytes, Some("req-1".into()), GovernanceContext::anonymous())
        .await
        .expect("first submission accepted");

    let err = engine
        .submit(&bytes, Some("req-2".into()), GovernanceContext::anonymous())
        .await
        .expect_err("conflicting key must be rejected");
    assert!(matches!(err, EngineError::IdempotencyConflict(id) if id == "wf-idem"));
}
