//! Failure with compensation: succeeded tasks roll back in reverse
//! topological order; the workflow terminal state stays failed.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::*;
use swarmlite_kernel::audit::AuditEvent;
use swarmlite_kernel::prelude::*;

#[tokio::test]
async fn failed_tail_rolls_back_succeeded_tasks_in_reverse_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = RecordingHandler::new(events.clone());
    let failing = FailingHandler::permanent("downstream rejected the batch");

    let mut registry = HandlerRegistry::new();
    registry.register("test", "do_a", recorder.clone());
    registry.register("test", "do_b", recorder.clone());
    registry.register("test", "do_c", failing);
    registry.register_compensator("undo_a", recorder.clone());
    registry.register_compensator("undo_b", recorder.clone());

    let definition = json!({
        "workflow_id": "wf-comp",
        "tasks": [
            { "id": "a", "type": "test", "config": { "function": "do_a" } },
            { "id": "b", "type": "test", "depends_on": ["a"], "config": { "function": "do_b" } },
            { "id": "c", "type": "test", "depends_on": ["b"], "config": { "function": "do_c" } }
        ],
        "retry_policy": { "max_attempts": 1, "delay_seconds": 0, "jitter_fraction": 0 },
        "compensation_handlers": { "a": "undo_a", "b": "undo_b" }
    });

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));
    let workflow_id = engine
        .submit(&definition_bytes(&definition), None, GovernanceContext::anonymous())
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(
        snapshot.task("a").expect("a present").status,
        TaskStatus::Rollback
    );
    assert_eq!(
        snapshot.task("b").expect("b present").status,
        TaskStatus::Rollback
    );
    assert_eq!(
        snapshot.task("c").expect("c present").status,
        TaskStatus::Failed
    );

    // Execution order a then b; compensation order b then a.
    assert_eq!(
        *events.lock().expect("event log"),
        vec!["exec:a", "exec:b", "comp:b", "comp:a"]
    );

    // COMPENSATION_RUN audit records appear for b then a, and the chain
    // still verifies.
    let records = audit.records(&workflow_id).await.expect("audit readable");
    let compensated: Vec<&str> = records
        .iter()
        .filter(|r| r.event == AuditEvent::CompensationRun)
        .filter_map(|r| r.task_id.as_deref())
        .collect();
    assert_eq!(compensated, vec!["b", "a"]);
    audit.verify_chain(&workflow_id).await.expect("chain intact");

    // Nothing is left unsettled after the terminal state.
    for task in &snapshot.tasks {
        assert!(matches!(
            task.status,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Rollback | TaskStatus::Skipped
        ));
    }
}

#[tokio::test]
async fn tasks_without_compensation_handlers_keep_success() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = RecordingHandler::new(events.clone());
    let failing = FailingHandler::permanent("boom");

    let mut registry = HandlerRegistry::new();
    registry.register("test", "do_a", recorder.clone());
    registry.register("test", "do_b", failing);
    registry.register_compensator("never_used", recorder.clone());

    // a succeeds but registers no compensation handler.
    let definition = json!({
        "workflow_id": "wf-no-comp",
        "tasks": [
            { "id": "a", "type": "test", "config": { "function": "do_a" } },
            { "id": "b", "type": "test", "depends_on": ["a"], "config": { "function": "do_b" } }
        ],
        "retry_policy": { "max_attempts": 1, "delay_seconds": 0, "jitter_fraction": 0 }
    });

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));
    let workflow_id = engine
        .submit(&definition_bytes(&definition), None, GovernanceContext::anonymous())
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(
        snapshot.task("a").expect("a present").status,
        TaskStatus::Success,
        "no handler registered, so the side effect is recorded as not undone"
    );

    let records = audit.records(&workflow_id).await.expect("audit readable");
    assert!(!records
        .iter()
        .any(|r| r.event == AuditEvent::CompensationRun));
    assert_eq!(*events.lock().expect("event log"), vec!["exec:a"]);
}

#[tokio::test]
async fn failure_skips_transitive_descendants() {
    let failing = FailingHandler::permanent("no luck");
    let counting = CountingHandler::new();

    let mut registry = HandlerRegistry::new();
    registry.register("test", "fail", failing);
    registry.register_default("test", counting.clone());

    // a fails; b and c (which depends on b) must be skipped, d still runs.
    let definition = json!({
        "workflow_id": "wf-skip",
        "tasks": [
            { "id": "a", "type": "test", "config": { "function": "fail" } },
            { "id": "b", "type": "test", "depends_on": ["a"] },
            { "id": "c", "type": "test", "depends_on": ["b"] },
            { "id": "d", "type": "test" }
        ],
        "retry_policy": { "max_attempts": 1, "delay_seconds": 0, "jitter_fraction": 0 }
    });

    let (engine, _store, _audit) = build_engine(registry, Arc::new(AllowAll));
    let workflow_id = engine
        .submit(&definition_bytes(&definition), None, GovernanceContext::anonymous())
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, WorkflowStatus::Failed);
    assert_eq!(snapshot.task("a").expect("a").status, TaskStatus::Failed);
    assert_eq!(snapshot.task("b").expect("b").status, TaskStatus::Skipped);
    assert_eq!(snapshot.task("c").expect("c").status, TaskStatus::Skipped);
    assert_eq!(snapshot.task("d").expect("d").status, TaskStatus::Success);

    // Skipped tasks never reach a handler.
    assert_eq!(counting.invocations(), 1);
    assert_eq!(snapshot.task("b").expect("b").attempt, 0);
    assert_eq!(snapshot.task("c").expect("c").attempt, 0);
}
