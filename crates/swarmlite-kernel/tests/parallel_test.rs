//! Parallel independents: siblings run concurrently on the shared pool;
//! a join task starts only after every dependency succeeded.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use swarmlite_kernel::prelude::*;

#[tokio::test(start_paused = true)]
async fn independent_tasks_overlap_and_join_waits() {
    let handler = SleepyHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", handler.clone());

    // a sleeps 300 ms, b sleeps 500 ms, c joins on both and sleeps 100 ms.
    let definition = json!({
        "workflow_id": "wf-parallel",
        "tasks": [
            { "id": "a", "type": "test", "config": { "params": { "delay_ms": 300 } } },
            { "id": "b", "type": "test", "config": { "params": { "delay_ms": 500 } } },
            {
                "id": "c",
                "type": "test",
                "depends_on": ["a", "b"],
                "config": { "params": { "delay_ms": 100 } }
            }
        ]
    });

    let (engine, _store, audit) = build_engine(registry, Arc::new(AllowAll));

    let started = tokio::time::Instant::now();
    let workflow_id = engine
        .submit(&definition_bytes(&definition), None, GovernanceContext::anonymous())
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(30)).await;
    let elapsed = started.elapsed();

    assert_eq!(snapshot.status, WorkflowStatus::Success);
    assert_eq!(handler.invocations(), 3);

    // Wall clock ≈ max(a, b) + c, not the sum (300 + 500 + 100).
    assert!(
        elapsed >= Duration::from_millis(600),
        "elapsed {elapsed:?} shorter than the critical path"
    );
    assert!(
        elapsed < Duration::from_millis(880),
        "elapsed {elapsed:?} suggests sequential execution"
    );

    // c is dispatched only after both a and b succeeded.
    let records = audit.records(&workflow_id).await.expect("audit readable");
    let position = |task: &str, to: &str| {
        records
            .iter()
            .position(|r| {
                r.task_id.as_deref() == Some(task) && r.to_state.as_deref() == Some(to)
            })
            .unwrap_or_else(|| panic!("no {task} -> {to} record"))
    };
    let c_running = position("c", "running");
    assert!(position("a", "success") < c_running);
    assert!(position("b", "success") < c_running);
}

#[tokio::test(start_paused = true)]
async fn pool_bound_limits_concurrency() {
    let handler = SleepyHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register_default("test", handler.clone());

    // Four independent 100 ms tasks over a pool of one worker must run
    // one after another.
    let definition = json!({
        "workflow_id": "wf-serial-pool",
        "tasks": [
            { "id": "a", "type": "test", "config": { "params": { "delay_ms": 100 } } },
            { "id": "b", "type": "test", "config": { "params": { "delay_ms": 100 } } },
            { "id": "c", "type": "test", "config": { "params": { "delay_ms": 100 } } },
            { "id": "d", "type": "test", "config": { "params": { "delay_ms": 100 } } }
        ]
    });

    let config = test_config().with_parallelism(1);
    let (engine, _store, _audit) =
        build_engine_with_config(config, registry, Arc::new(AllowAll));

    let started = tokio::time::Instant::now();
    let workflow_id = engine
        .submit(&definition_bytes(&definition), None, GovernanceContext::anonymous())
        .await
        .expect("submission should be accepted");

    let snapshot = wait_terminal(&engine, &workflow_id, Duration::from_secs(30)).await;
    let elapsed = started.elapsed();

    assert_eq!(snapshot.status, WorkflowStatus::Success);
    assert!(
        elapsed >= Duration::from_millis(400),
        "elapsed {elapsed:?} implies more than one concurrent worker"
    );
}
