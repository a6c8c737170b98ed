//! Structural validation: duplicate ids, dependency resolution, cycle
//! detection, and topological ordering.
//!
//! The graph is small and bespoke, so Kahn's algorithm and the
//! depth-first cycle walk are implemented directly rather than pulled
//! from a graph library.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;

use super::{TaskDefinition, ValidationError, WorkflowDefinition};
use crate::workflow::{Task, TaskStatus, Workflow, WorkflowStatus};

/// Validate a parsed definition into a runnable [`Workflow`].
///
/// Establishes every structural invariant: unique task ids, resolvable
/// dependencies, acyclicity, a checked retry policy, and compensation
/// handlers that reference real tasks. Tasks start `Pending` with
/// `attempt = 0`.
pub fn validate(
    definition: WorkflowDefinition,
    idempotency_key: Option<String>,
) -> Result<Workflow, ValidationError> {
    if definition.tasks.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
    for def in &definition.tasks {
        if tasks.contains_key(&def.id) {
            return Err(ValidationError::DuplicateTaskId(def.id.clone()));
        }
        tasks.insert(def.id.clone(), build_task(def));
    }

    for def in &definition.tasks {
        for dep in &def.depends_on {
            if !tasks.contains_key(dep) {
                return Err(ValidationError::UnknownDependency {
                    task: def.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    for task_id in definition.compensation_handlers.keys() {
        if !tasks.contains_key(task_id) {
            return Err(ValidationError::InvalidField {
                path: format!("compensation_handlers.{task_id}"),
                reason: "no such task".into(),
            });
        }
    }

    detect_cycles(&tasks)?;
    let topo_order = topological_order(&tasks);

    let now = Utc::now();
    Ok(Workflow {
        workflow_id: definition.workflow_id,
        tasks,
        retry_policy: definition.retry_policy,
        compensation_handlers: definition.compensation_handlers,
        topo_order,
        status: WorkflowStatus::Pending,
        idempotency_key,
        last_error: None,
        created_at: now,
        updated_at: now,
    })
}

fn build_task(def: &TaskDefinition) -> Task {
    Task {
        task_id: def.id.clone(),
        task_type: def.task_type.clone(),
        depends_on: def.depends_on.clone(),
        config: def.config.clone(),
        data_classification: def.data_classification,
        status: TaskStatus::Pending,
        attempt: 0,
        last_error: None,
        started_at: None,
        finished_at: None,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first walk reporting the back-edge path on the first cycle found.
fn detect_cycles(tasks: &BTreeMap<String, Task>) -> Result<(), ValidationError> {
    let mut colors: HashMap<&str, Color> =
        tasks.keys().map(|id| (id.as_str(), Color::White)).collect();

    for start in tasks.keys() {
        if colors[start.as_str()] == Color::White {
            let mut path = Vec::new();
            visit(start, tasks, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    task_id: &'a str,
    tasks: &'a BTreeMap<String, Task>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<(), ValidationError> {
    colors.insert(task_id, Color::Gray);
    path.push(task_id);

    // Edges point dependency -> dependent, but walking depends_on links
    // finds the same cycles with the path in dependency order.
    if let Some(task) = tasks.get(task_id) {
        for dep in &task.depends_on {
            match colors[dep.as_str()] {
                Color::Gray => {
                    let cycle_start = path
                        .iter()
                        .position(|id| *id == dep.as_str())
                        .unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[cycle_start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Err(ValidationError::CycleDetected(cycle));
                }
                Color::White => {
                    let dep = tasks
                        .get_key_value(dep.as_str())
                        .map(|(k, _)| k.as_str())
                        .unwrap_or(dep.as_str());
                    visit(dep, tasks, colors, path)?;
                }
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(task_id, Color::Black);
    Ok(())
}

/// Kahn's algorithm; the ready frontier is a `BTreeSet` so ties resolve in
/// task-id order and the result is deterministic.
fn topological_order(tasks: &BTreeMap<String, Task>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|(id, task)| (id.as_str(), task.depends_on.len()))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (id, task) in tasks {
        for dep in &task.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(id.as_str());
        }
    }

    let mut frontier: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = frontier.pop_first() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.insert(*dependent);
                    }
                }
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::super::parse_definition;
    use super::*;
    use serde_json::json;

    fn workflow_from(doc: serde_json::Value) -> Result<Workflow, ValidationError> {
        validate(parse_definition(&doc)?, None)
    }

    #[test]
    fn test_valid_chain() {
        let workflow = workflow_from(json!({
            "workflow_id": "chain",
            "tasks": [
                { "id": "c", "type": "python", "depends_on": ["b"] },
                { "id": "a", "type": "python" },
                { "id": "b", "type": "python", "depends_on": ["a"] }
            ]
        }))
        .unwrap();

        assert_eq!(workflow.topo_order, vec!["a", "b", "c"]);
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert!(workflow
            .tasks
            .values()
            .all(|t| t.status == TaskStatus::Pending && t.attempt == 0));
    }

    #[test]
    fn test_diamond_topo_order_is_deterministic() {
        let workflow = workflow_from(json!({
            "workflow_id": "diamond",
            "tasks": [
                { "id": "d", "type": "python", "depends_on": ["b", "c"] },
                { "id": "b", "type": "python", "depends_on": ["a"] },
                { "id": "c", "type": "python", "depends_on": ["a"] },
                { "id": "a", "type": "python" }
            ]
        }))
        .unwrap();

        assert_eq!(workflow.topo_order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_empty_tasks_rejected() {
        let err = workflow_from(json!({ "workflow_id": "wf", "tasks": [] })).unwrap_err();
        assert_eq!(err, ValidationError::EmptyWorkflow);
    }

    #[test]
    fn test_duplicate_task_id() {
        let err = workflow_from(json!({
            "workflow_id": "wf",
            "tasks": [
                { "id": "a", "type": "python" },
                { "id": "a", "type": "http" }
            ]
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateTaskId("a".into()));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = workflow_from(json!({
            "workflow_id": "wf",
            "tasks": [
                { "id": "a", "type": "python", "depends_on": ["ghost"] }
            ]
        }))
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                task: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = workflow_from(json!({
            "workflow_id": "wf",
            "tasks": [
                { "id": "a", "type": "python", "depends_on": ["a"] }
            ]
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::CycleDetected(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let err = workflow_from(json!({
            "workflow_id": "wf",
            "tasks": [
                { "id": "a", "type": "python", "depends_on": ["b"] },
                { "id": "b", "type": "python", "depends_on": ["a"] }
            ]
        }))
        .unwrap_err();

        match err {
            ValidationError::CycleDetected(path) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_compensation_handler_for_unknown_task() {
        let err = workflow_from(json!({
            "workflow_id": "wf",
            "tasks": [ { "id": "a", "type": "python" } ],
            "compensation_handlers": { "ghost": "undo" }
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidField { .. }));
    }
}
