//! Service configuration, loaded once at startup and passed explicitly to
//! the scheduler and sandbox.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{
    error::Error,
    normalize::StderrPolicy,
    registry::{LanguageDescriptor, RunnerRegistry},
    types::{duration_ms, ResourceLimits},
    Result,
};

/// What happens to a submission when every worker is busy and the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail fast with `AdmissionRejected`
    #[default]
    Reject,
    /// Suspend the submitter until capacity frees up
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Number of executions allowed to run at once
    pub pool_size: usize,
    /// Executions allowed to wait for a worker
    pub queue_depth: usize,
    pub overflow: OverflowPolicy,
    /// Finished executions kept around for status queries
    pub history_limit: usize,
    /// Parent directory for per-execution working areas
    pub work_root: PathBuf,
    #[serde(rename = "compile_timeout_ms", with = "duration_ms")]
    pub compile_timeout: Duration,
    pub stderr_policy: StderrPolicy,
    /// Limits applied when the request asks for nothing specific
    pub default_limits: ResourceLimits,
    /// Hard ceilings no request can exceed
    pub max_limits: ResourceLimits,
    /// Descriptors added to or replacing the built-in table
    pub languages: Vec<LanguageDescriptor>,
    pub disabled_languages: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue_depth: 32,
            overflow: OverflowPolicy::default(),
            history_limit: 1024,
            work_root: std::env::temp_dir().join("exec-broker"),
            compile_timeout: Duration::from_secs(30),
            stderr_policy: StderrPolicy::default(),
            default_limits: ResourceLimits::default(),
            max_limits: ResourceLimits {
                wall_clock_timeout: Duration::from_secs(30),
                memory_ceiling_bytes: 1024 * 1024 * 1024, // 1GB
                max_output_bytes: 1024 * 1024,            // 1MB
                file_size_bytes: 64 * 1024 * 1024,        // 64MB
                max_processes: 256,
            },
            languages: Vec::new(),
            disabled_languages: Vec::new(),
        }
    }
}

impl ExecConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ExecConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.compile_timeout.is_zero() {
            return Err(Error::Config("compile_timeout_ms must be positive".to_string()));
        }
        for (name, limits) in [("default_limits", &self.default_limits), ("max_limits", &self.max_limits)] {
            if limits.wall_clock_timeout.is_zero()
                || limits.memory_ceiling_bytes == 0
                || limits.max_output_bytes == 0
                || limits.file_size_bytes == 0
                || limits.max_processes == 0
            {
                return Err(Error::Config(format!("{} must all be positive", name)));
            }
        }
        if self.default_limits.clamp_to(&self.max_limits) != self.default_limits {
            return Err(Error::Config(
                "default_limits must not exceed max_limits".to_string(),
            ));
        }
        for descriptor in &self.languages {
            descriptor.validate()?;
        }
        Ok(())
    }

    /// Limits for one request: the defaults with the caller's timeout, then
    /// clamped to the server maxima
    pub fn limits_for(&self, requested_timeout: Option<Duration>) -> ResourceLimits {
        let mut limits = self.default_limits.clone();
        if let Some(timeout) = requested_timeout.filter(|t| !t.is_zero()) {
            limits.wall_clock_timeout = timeout;
        }
        limits.clamp_to(&self.max_limits)
    }

    /// Built-in languages with this configuration's overrides applied
    pub fn registry(&self) -> Result<RunnerRegistry> {
        RunnerRegistry::with_overrides(&self.languages, &self.disabled_languages)
    }
}
