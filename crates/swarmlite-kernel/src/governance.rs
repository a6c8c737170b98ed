//! Governance gate: a pure allow/deny decision consulted once per task,
//! immediately before promotion to `Running`.
//!
//! The kernel only specifies the interface; the gate itself is supplied by
//! configuration. [`PolicyGate`] is the config-file-backed implementation
//! loaded from `GOVERNANCE_CONFIG_PATH`, and [`AllowAll`] is the default
//! when no policy is configured.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::workflow::{DataClassification, Task};

/// Outcome of a governance check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Opaque carrier of governance inputs supplied by the submitter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernanceContext {
    /// Caller identity (`X-Client-ID` at the REST layer)
    pub client_id: Option<String>,

    /// Request origin (`X-Request-Source` at the REST layer)
    pub request_source: Option<String>,
}

impl GovernanceContext {
    pub fn new(
        client_id: impl Into<String>,
        request_source: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            request_source: Some(request_source.into()),
        }
    }

    /// Context with no caller identity attached
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Pure decision function consulted before each task runs
pub trait GovernanceGate: Send + Sync + 'static {
    fn check(&self, task: &Task, context: &GovernanceContext) -> Decision;
}

/// Gate that allows every task
pub struct AllowAll;

impl GovernanceGate for AllowAll {
    fn check(&self, _task: &Task, _context: &GovernanceContext) -> Decision {
        Decision::Allow
    }
}

/// Error loading a governance policy file
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("failed to read governance config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse governance config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Declarative governance policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Classifications that may run at all; absent classifications are
    /// denied with `<classification>_not_allowed`
    #[serde(default = "PolicyConfig::default_allowed")]
    pub allowed_classifications: Vec<DataClassification>,

    /// Request sources required per classification; a task with a listed
    /// classification is denied unless the context's source matches
    #[serde(default)]
    pub required_sources: BTreeMap<DataClassification, Vec<String>>,

    /// Client ids that are denied outright
    #[serde(default)]
    pub denied_clients: Vec<String>,
}

impl PolicyConfig {
    fn default_allowed() -> Vec<DataClassification> {
        vec![
            DataClassification::Public,
            DataClassification::Pii,
            DataClassification::Phi,
        ]
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_classifications: Self::default_allowed(),
            required_sources: BTreeMap::new(),
            denied_clients: vec![],
        }
    }
}

/// Config-file-backed gate; a pure function of `(task, context)` once
/// loaded
pub struct PolicyGate {
    config: PolicyConfig,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Load a policy from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GovernanceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| GovernanceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| GovernanceError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::new(config))
    }
}

/// Build the configured gate: [`PolicyGate`] when
/// `GOVERNANCE_CONFIG_PATH` is set, [`AllowAll`] otherwise
pub fn gate_from_config(
    config: &crate::config::KernelConfig,
) -> Result<std::sync::Arc<dyn GovernanceGate>, GovernanceError> {
    match &config.governance_config_path {
        Some(path) => Ok(std::sync::Arc::new(PolicyGate::from_path(path)?)),
        None => Ok(std::sync::Arc::new(AllowAll)),
    }
}

impl GovernanceGate for PolicyGate {
    fn check(&self, task: &Task, context: &GovernanceContext) -> Decision {
        if let Some(client_id) = &context.client_id {
            if self.config.denied_clients.contains(client_id) {
                return Decision::Deny(format!("client_denied:{client_id}"));
            }
        }

        let classification = task.data_classification;
        if !self
            .config
            .allowed_classifications
            .contains(&classification)
        {
            return Decision::Deny(format!("{classification}_not_allowed"));
        }

        if let Some(sources) = self.config.required_sources.get(&classification) {
            let matched = context
                .request_source
                .as_ref()
                .is_some_and(|source| sources.contains(source));
            if !matched {
                return Decision::Deny(format!(
                    "{classification}_requires_approved_source"
                ));
            }
        }

        Decision::Allow
    }
}
