//! Handler registry: resolves `task.type` + `config.function` to an
//! executable handler, and compensation handler names for rollback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::workflow::Task;

use super::TaskHandler;

/// Errors from handler resolution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No handler matches the task's type and function
    #[error("no handler registered for type {task_type} function {function}")]
    HandlerNotFound { task_type: String, function: String },

    /// No default handler for a task type without a function
    #[error("no default handler registered for type {0}")]
    NoDefaultHandler(String),

    /// A compensation handler name resolves to nothing
    #[error("no compensation handler named {0}")]
    CompensatorNotFound(String),
}

/// Registry of named task handlers
///
/// Handlers are registered under `(type, function)`; a task whose config
/// omits `function` resolves the type's default handler. Compensation
/// handler names (the values of a workflow's `compensation_handlers` map)
/// resolve against every registered function name plus any explicitly
/// registered compensators.
#[derive(Default)]
pub struct HandlerRegistry {
    by_function: HashMap<(String, String), Arc<dyn TaskHandler>>,
    defaults: HashMap<String, Arc<dyn TaskHandler>>,
    named: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a `(type, function)` pair
    ///
    /// The function name also becomes resolvable as a compensation handler
    /// name.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        function: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        let task_type = task_type.into();
        let function = function.into();
        self.named.insert(function.clone(), handler.clone());
        self.by_function.insert((task_type, function), handler);
    }

    /// Register the default handler for a task type
    pub fn register_default(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.defaults.insert(task_type.into(), handler);
    }

    /// Register a handler resolvable only by name (for compensation)
    pub fn register_compensator(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.named.insert(name.into(), handler);
    }

    /// Resolve the handler for a task
    pub fn resolve(&self, task: &Task) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        match task.function() {
            Some(function) => self
                .by_function
                .get(&(task.task_type.clone(), function.to_string()))
                .cloned()
                .ok_or_else(|| RegistryError::HandlerNotFound {
                    task_type: task.task_type.clone(),
                    function: function.to_string(),
                }),
            None => self
                .defaults
                .get(&task.task_type)
                .cloned()
                .ok_or_else(|| RegistryError::NoDefaultHandler(task.task_type.clone())),
        }
    }

    /// Resolve a compensation handler by its registered name
    pub fn resolve_compensator(
        &self,
        name: &str,
    ) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::CompensatorNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_function.len() + self.defaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_function.is_empty() && self.defaults.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("functions", &self.by_function.keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults.keys().collect::<Vec<_>>())
            .finish()
    }
}
