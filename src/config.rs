use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::template::OnTaskError;
use crate::{zlog_debug, Error, Result};

/// What happens once `executions_on_failure_left` (node loss retries) is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureExhaustion {
    /// Treat it like an exhausted execution error and consult `on_task_error`.
    ApplyOnTaskError,
    /// The whole job fails regardless of the task policy.
    #[default]
    FailJob,
}

/// How user supplied task names containing `#` or `*` are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservedNamePolicy {
    /// Refuse the template with a validation error.
    #[default]
    Reject,
    /// Replace each reserved character with `substitute_char`.
    Substitute,
}

/// Task naming constraints shared by template validation and graph mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingRules {
    pub reserved_names: ReservedNamePolicy,
    pub substitute_char: char,
    pub max_name_length: usize,
}

impl Default for NamingRules {
    fn default() -> Self {
        SchedulerConfig::default().naming()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Job-level default: an exhausted task under the NONE policy fails the job.
    pub cancel_job_on_error: bool,
    /// Job-level policy used when a task template leaves `on_task_error` at NONE.
    pub on_task_error: OnTaskError,
    pub failure_exhaustion: FailureExhaustion,
    pub reserved_names: ReservedNamePolicy,
    pub substitute_char: char,
    /// Base delay of the restart backoff, in milliseconds.
    pub restart_delay_ms: u64,
    pub max_name_length: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cancel_job_on_error: true,
            on_task_error: OnTaskError::None,
            failure_exhaustion: FailureExhaustion::FailJob,
            reserved_names: ReservedNamePolicy::Reject,
            substitute_char: '_',
            restart_delay_ms: 1000,
            max_name_length: 255,
        }
    }
}

impl SchedulerConfig {
    pub fn naming(&self) -> NamingRules {
        NamingRules {
            reserved_names: self.reserved_names,
            substitute_char: self.substitute_char,
            max_name_length: self.max_name_length,
        }
    }

    pub fn jobflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".jobflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::jobflow_dir()?.join("jobflow.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        zlog_debug!("SchedulerConfig::load path={}", path.display());
        if !path.exists() {
            zlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        zlog_debug!(
            "Config loaded: cancel_job_on_error={}, on_task_error={:?}, failure_exhaustion={:?}, reserved_names={:?}",
            config.cancel_job_on_error,
            config.on_task_error,
            config.failure_exhaustion,
            config.reserved_names
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        zlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if crate::core::identity::is_reserved(self.substitute_char) {
            return Err(Error::Validation(format!(
                "substitute_char '{}' is itself reserved",
                self.substitute_char
            )));
        }
        if self.max_name_length == 0 {
            return Err(Error::Validation(
                "max_name_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
