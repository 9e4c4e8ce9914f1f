//! Typed configuration.
//!
//! Process-level settings (backend, table, database URL, telemetry) come
//! from environment variables and load once at startup. Pipeline settings
//! (group size, retry policy, dispatch target, stage commands) come from a
//! TOML file so they can be versioned alongside the job definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Stage;
use crate::retry::ExponentialBackoff;
use crate::store::dynamo::MAX_BATCH_WRITE_ITEMS;

/// Which store implementation backs the tracking table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Dynamodb,
    Postgres,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Dynamodb => "dynamodb",
            Backend::Postgres => "postgres",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dynamodb" | "dynamo" => Ok(Backend::Dynamodb),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(Error::Config(format!(
                "unknown TRACKING_BACKEND '{other}' (expected dynamodb or postgres)"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub backend: Backend,
    pub table_name: String,
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let backend = match std::env::var("TRACKING_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => Backend::Dynamodb,
        };
        let database_url = std::env::var("DATABASE_URL").ok().map(SecretString::from);
        if backend == Backend::Postgres && database_url.is_none() {
            return Err(Error::Config(
                "required environment variable DATABASE_URL is not set".to_string(),
            ));
        }

        Ok(Self {
            backend,
            table_name: required_var("TRACKING_TABLE")?,
            database_url,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Pipeline file
// ---------------------------------------------------------------------------

/// Contents of `pipeline.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tracking: TrackingSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    stages: BTreeMap<String, StageConfig>,
}

/// Store and grouping settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingSettings {
    /// Items per group, fixed at index time.
    pub group_size: usize,
    /// Initial items per bulk write. The DynamoDB backend accepts at most
    /// [`MAX_BATCH_WRITE_ITEMS`].
    pub write_batch_size: usize,
    /// Records examined per scan page.
    pub page_size: usize,
    /// Exclude in-progress items when a stage with a prerequisite is
    /// selected. Stages without a prerequisite always exclude them.
    pub ready_excludes_in_progress: bool,
    pub retry: ExponentialBackoff,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            group_size: 10,
            write_batch_size: 25,
            page_size: 1000,
            ready_excludes_in_progress: false,
            retry: ExponentialBackoff::default(),
        }
    }
}

impl TrackingSettings {
    /// Check limits that depend on the backend in use.
    pub fn validate_for(&self, backend: Backend) -> Result<()> {
        if backend == Backend::Dynamodb && self.write_batch_size > MAX_BATCH_WRITE_ITEMS {
            return Err(Error::Config(format!(
                "tracking.write_batch_size {} exceeds DynamoDB's limit of {MAX_BATCH_WRITE_ITEMS}",
                self.write_batch_size
            )));
        }
        Ok(())
    }
}

/// How jobs are submitted to the execution service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    pub job_definition: String,
    pub job_queue: String,
    pub job_name_prefix: String,
    /// Name of the single environment variable carrying the group key.
    pub group_env_var: String,
    pub platform: JobPlatform,
    /// Cap on jobs per dispatch run.
    pub max_jobs: Option<usize>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            job_definition: String::new(),
            job_queue: String::new(),
            job_name_prefix: "batchtrack".to_string(),
            group_env_var: "BATCHINDEX".to_string(),
            platform: JobPlatform::Eks,
            max_jobs: None,
        }
    }
}

impl DispatchSettings {
    /// Fail fast before any job is submitted.
    pub fn validate(&self) -> Result<()> {
        if self.job_definition.trim().is_empty() {
            return Err(Error::Config("dispatch.job_definition is empty".to_string()));
        }
        if self.job_queue.trim().is_empty() {
            return Err(Error::Config("dispatch.job_queue is empty".to_string()));
        }
        if self.group_env_var.trim().is_empty() {
            return Err(Error::Config("dispatch.group_env_var is empty".to_string()));
        }
        Ok(())
    }
}

/// Container platform the job definition targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPlatform {
    Eks,
    Ecs,
}

/// The command a worker runs for one stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PipelineConfig {
    /// Parse and validate a TOML pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad pipeline config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tracking.group_size == 0 {
            return Err(Error::Config("tracking.group_size must be at least 1".to_string()));
        }
        if self.tracking.write_batch_size == 0 {
            return Err(Error::Config(
                "tracking.write_batch_size must be at least 1".to_string(),
            ));
        }
        for name in self.stages.keys() {
            name.parse::<Stage>()?;
        }
        Ok(())
    }

    /// Command configured for `stage`, if any.
    pub fn stage(&self, stage: Stage) -> Option<&StageConfig> {
        self.stages
            .iter()
            .find(|(name, _)| name.parse::<Stage>().is_ok_and(|s| s == stage))
            .map(|(_, config)| config)
    }

    /// Every configured stage command, keyed by validated stage.
    pub fn stage_commands(&self) -> BTreeMap<Stage, StageConfig> {
        self.stages
            .iter()
            .filter_map(|(name, config)| Some((name.parse::<Stage>().ok()?, config.clone())))
            .collect()
    }
}
