//! Linear happy path: a four-task chain runs to success with a fully
//! ordered, verifiable audit trail.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use swarmlite_kernel::audit::AuditEvent;
use swarmlite_kernel::prelude::*;

fn chain_definition() -> serde_json::Value {
    json!({
        "workflow_id": "wf-linear",
        "tasks": [
            { "id": "a", "type": "test" },
            { "id": "b", "type": "test", "depends_on": ["a"] },
            { "id": "c", "type": "test", "depends_on": ["b"] },
            { "id": "d", "type": "test", "depends_on": ["c"] }
        ]
    })
}

#[test_log::test(tokio::test)]
async fn linear_chain_succeeds_in_order() {
    let handler = CountingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", handler.clone());

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));

    let workflow_id = engine
        .submit(
            &definition_bytes(&chain_definition()),
            None,
            GovernanceContext::anonymous(),
        )
        .await
        .expect("submission should be accepted");
    assert_eq!(workflow_id, "wf-linear");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, WorkflowStatus::Success);
    assert_eq!(handler.invocations(), 4);
    for task in &snapshot.tasks {
        assert_eq!(task.status, TaskStatus::Success, "task {}", task.task_id);
        assert_eq!(task.attempt, 1);
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    // The audit trail is totally ordered: created, started, then each
    // task's pending→ready→running→success in chain order, then terminal.
    let records = audit.records(&workflow_id).await.expect("audit readable");
    let observed: Vec<(AuditEvent, Option<String>, Option<String>, Option<String>)> = records
        .iter()
        .map(|r| {
            (
                r.event,
                r.task_id.clone(),
                r.from_state.clone(),
                r.to_state.clone(),
            )
        })
        .collect();

    let mut expected = vec![
        (
            AuditEvent::WorkflowCreated,
            None,
            None,
            Some("pending".to_string()),
        ),
        (
            AuditEvent::WorkflowStarted,
            None,
            Some("pending".to_string()),
            Some("running".to_string()),
        ),
    ];
    for task in ["a", "b", "c", "d"] {
        for (from, to) in [
            ("pending", "ready"),
            ("ready", "running"),
            ("running", "success"),
        ] {
            expected.push((
                AuditEvent::TaskTransition,
                Some(task.to_string()),
                Some(from.to_string()),
                Some(to.to_string()),
            ));
        }
    }
    expected.push((
        AuditEvent::WorkflowTerminal,
        None,
        Some("running".to_string()),
        Some("success".to_string()),
    ));

    assert_eq!(observed, expected);

    // The chain verifies end to end.
    assert_eq!(
        audit.verify_chain(&workflow_id).await.expect("chain intact"),
        records.len()
    );
}

#[tokio::test]
async fn terminal_workflow_has_no_unsettled_tasks() {
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", CountingHandler::new());

    let (engine, _store, _audit) = build_engine(registry, Arc::new(AllowAll));
    let workflow_id = engine
        .submit(
            &definition_bytes(&chain_definition()),
            None,
            GovernanceContext::anonymous(),
        )
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(5)).await;
    for task in &snapshot.tasks {
        assert!(
            matches!(
                task.status,
                TaskStatus::Success
                    | TaskStatus::Failed
                    | TaskStatus::Rollback
                    | TaskStatus::Skipped
            ),
            "task {} left in {}",
            task.task_id,
            task.status
        );
    }
}
