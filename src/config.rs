//! Layered `labwright` settings: defaults, config files, then environment.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::operation::RunSettings;
use crate::retry::RetryPolicy;
use crate::spec::Thresholds;

/// Default location of the simulated backend's state file.
pub const DEFAULT_STATE_FILE: &str = ".labwright/state.json";

/// Orchestrator settings merged from defaults, `labwright.toml`, and
/// `LABWRIGHT_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "LABWRIGHT",
    discovery(
        app_name = "labwright",
        env_var = "LABWRIGHT_CONFIG_PATH",
        config_file_name = "labwright.toml",
        dotfile_name = ".labwright.toml",
        project_file_name = "labwright.toml"
    )
)]
pub struct LabConfig {
    /// Maximum number of backend work items in flight at once.
    #[ortho_config(default = 4)]
    pub concurrency_limit: u32,
    /// Attempts per backend operation, including the first.
    #[ortho_config(default = 5)]
    pub retry_max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[ortho_config(default = 500)]
    pub retry_initial_backoff_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds.
    #[ortho_config(default = 30_000)]
    pub retry_max_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    #[ortho_config(default = 2)]
    pub retry_multiplier: u32,
    /// Template group or folder copy count above which validation logs a
    /// warning.
    #[ortho_config(default = 25)]
    pub group_instances_warn: u32,
    /// Template group or folder copy count above which validation fails.
    #[ortho_config(default = 50)]
    pub group_instances_error: u32,
    /// Clones per service and group above which validation logs a warning.
    #[ortho_config(default = 50)]
    pub service_instances_warn: u32,
    /// Clones per service and group above which validation fails.
    #[ortho_config(default = 70)]
    pub service_instances_error: u32,
    /// Path of the simulated backend's persisted state.
    #[ortho_config(default = DEFAULT_STATE_FILE.to_owned())]
    pub state_file: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn message(&self, problem: &str) -> String {
        format!(
            "{} {problem}: set {} or {} in labwright.toml",
            self.description, self.env_var, self.toml_key
        )
    }
}

impl LabConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("labwright")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide corrected values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_positive(
            u64::from(self.concurrency_limit),
            &FieldMetadata::new(
                "concurrency limit",
                "LABWRIGHT_CONCURRENCY_LIMIT",
                "concurrency_limit",
            ),
        )?;
        Self::require_positive(
            u64::from(self.retry_max_attempts),
            &FieldMetadata::new(
                "retry ceiling",
                "LABWRIGHT_RETRY_MAX_ATTEMPTS",
                "retry_max_attempts",
            ),
        )?;
        Self::require_positive(
            u64::from(self.retry_multiplier),
            &FieldMetadata::new(
                "retry multiplier",
                "LABWRIGHT_RETRY_MULTIPLIER",
                "retry_multiplier",
            ),
        )?;
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return Err(ConfigError::Invalid(
                FieldMetadata::new(
                    "maximum retry backoff",
                    "LABWRIGHT_RETRY_MAX_BACKOFF_MS",
                    "retry_max_backoff_ms",
                )
                .message("must not be smaller than the initial backoff"),
            ));
        }
        if self.group_instances_error < self.group_instances_warn {
            return Err(ConfigError::Invalid(
                FieldMetadata::new(
                    "group instance error threshold",
                    "LABWRIGHT_GROUP_INSTANCES_ERROR",
                    "group_instances_error",
                )
                .message("must not be smaller than the warning threshold"),
            ));
        }
        if self.service_instances_error < self.service_instances_warn {
            return Err(ConfigError::Invalid(
                FieldMetadata::new(
                    "service instance error threshold",
                    "LABWRIGHT_SERVICE_INSTANCES_ERROR",
                    "service_instances_error",
                )
                .message("must not be smaller than the warning threshold"),
            ));
        }
        if self.state_file.trim().is_empty() {
            return Err(ConfigError::Invalid(
                FieldMetadata::new("state file", "LABWRIGHT_STATE_FILE", "state_file")
                    .message("must not be empty"),
            ));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(
                metadata.message("must be greater than zero"),
            ));
        }
        Ok(())
    }

    /// Builds the retry policy described by this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            multiplier: self.retry_multiplier,
        }
    }

    /// Instance thresholds enforced during validation.
    #[must_use]
    pub const fn thresholds(&self) -> Thresholds {
        Thresholds {
            group_instances_warn: self.group_instances_warn,
            group_instances_error: self.group_instances_error,
            service_instances_warn: self.service_instances_warn,
            service_instances_error: self.service_instances_error,
        }
    }

    /// Worker pool size as a `usize`.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        usize::try_from(self.concurrency_limit).unwrap_or(usize::MAX)
    }

    /// Concurrency and retry settings for the backend-facing phases.
    #[must_use]
    pub fn run_settings(&self) -> RunSettings {
        RunSettings::new(self.concurrency(), self.retry_policy())
    }

    /// State file path.
    #[must_use]
    pub fn state_file_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.state_file.trim())
    }

    /// Returns the configuration used when no file or environment overrides
    /// are present.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            concurrency_limit: 4,
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 30_000,
            retry_multiplier: 2,
            group_instances_warn: 25,
            group_instances_error: 50,
            service_instances_warn: 50,
            service_instances_error: 70,
            state_file: DEFAULT_STATE_FILE.to_owned(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
