//! Kernel configuration.
//!
//! Collaborators are injected explicitly; nothing here is process-global.
//! `from_env` fails fast with a descriptive error when required variables
//! are missing or too short, before any scheduler starts.

use std::path::PathBuf;
use std::time::Duration;

/// Minimum length for key material, in bytes
pub const MIN_KEY_BYTES: usize = 32;

/// Default worker pool size
pub const DEFAULT_PARALLELISM: usize = 20;

/// Configuration errors surfaced at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),

    #[error("{var} must be at least {min} bytes, got {got}")]
    TooShort {
        var: &'static str,
        min: usize,
        got: usize,
    },

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Explicit kernel configuration, passed into engine construction
#[derive(Clone)]
pub struct KernelConfig {
    /// Worker pool size `P`: the bound on concurrent task invocations
    /// across all workflows in this process
    pub parallelism: usize,

    /// Key for row signatures and the audit chain (≥ 32 bytes)
    pub audit_secret: Vec<u8>,

    /// Key material for at-rest field encryption; required if any workflow
    /// uses a non-public classification
    pub db_encryption_key: Option<Vec<u8>>,

    /// PostgreSQL connection string; absent means the in-memory store
    pub database_url: Option<String>,

    /// Path to the governance policy file; absent means allow-all
    pub governance_config_path: Option<PathBuf>,

    /// Wall-clock timeout applied to tasks that do not configure their own
    pub default_task_timeout: Option<Duration>,

    /// Attempts per store operation before the scheduler gives up
    pub store_retry_attempts: u32,

    /// Base backoff between store retries
    pub store_retry_base_delay: Duration,
}

impl KernelConfig {
    /// Build a config with defaults around a validated audit secret
    pub fn new(audit_secret: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let audit_secret = audit_secret.into();
        if audit_secret.len() < MIN_KEY_BYTES {
            return Err(ConfigError::TooShort {
                var: "AUDIT_SECRET_KEY",
                min: MIN_KEY_BYTES,
                got: audit_secret.len(),
            });
        }

        Ok(Self {
            parallelism: DEFAULT_PARALLELISM,
            audit_secret,
            db_encryption_key: None,
            database_url: None,
            governance_config_path: None,
            default_task_timeout: None,
            store_retry_attempts: 3,
            store_retry_base_delay: Duration::from_millis(200),
        })
    }

    /// Load from the environment, failing fast on missing or short keys
    ///
    /// Required: `AUDIT_SECRET_KEY`. Optional: `DB_ENCRYPTION_KEY`,
    /// `DATABASE_URL`, `GOVERNANCE_CONFIG_PATH`, `SWARMLITE_PARALLELISM`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let audit_secret = std::env::var("AUDIT_SECRET_KEY")
            .map_err(|_| ConfigError::Missing("AUDIT_SECRET_KEY"))?;
        let mut config = Self::new(audit_secret.into_bytes())?;

        if let Ok(key) = std::env::var("DB_ENCRYPTION_KEY") {
            config = config.with_db_encryption_key(key.into_bytes())?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Ok(path) = std::env::var("GOVERNANCE_CONFIG_PATH") {
            config.governance_config_path = Some(PathBuf::from(path));
        }

        if let Ok(raw) = std::env::var("SWARMLITE_PARALLELISM") {
            let parallelism = raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
                var: "SWARMLITE_PARALLELISM",
                reason: format!("expected a positive integer, got {raw:?}"),
            })?;
            if parallelism == 0 {
                return Err(ConfigError::Invalid {
                    var: "SWARMLITE_PARALLELISM",
                    reason: "must be at least 1".to_string(),
                });
            }
            config.parallelism = parallelism;
        }

        Ok(config)
    }

    /// Set the field encryption key (validated for length)
    pub fn with_db_encryption_key(
        mut self,
        key: impl Into<Vec<u8>>,
    ) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.len() < MIN_KEY_BYTES {
            return Err(ConfigError::TooShort {
                var: "DB_ENCRYPTION_KEY",
                min: MIN_KEY_BYTES,
                got: key.len(),
            });
        }
        self.db_encryption_key = Some(key);
        Ok(self)
    }

    /// Set the worker pool size
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the default per-task timeout
    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = Some(timeout);
        self
    }

    /// Tune scheduler-side store retries
    pub fn with_store_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.store_retry_attempts = attempts.max(1);
        self.store_retry_base_delay = base_delay;
        self
    }
}

impl std::fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConfig")
            .field("parallelism", &self.parallelism)
            .field("audit_secret", &"<redacted>")
            .field(
                "db_encryption_key",
                &self.db_encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .field("database_url", &self.database_url)
            .field("governance_config_path", &self.governance_config_path)
            .field("default_task_timeout", &self.default_task_timeout)
            .field("store_retry_attempts", &self.store_retry_attempts)
            .field("store_retry_base_delay", &self.store_retry_base_delay)
            .finish()
    }
}
