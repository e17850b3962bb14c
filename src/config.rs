//! Orchestrator configuration
//!
//! Loaded with the `config` crate from an optional YAML/TOML file, then
//! overridden by `TRIBUTARY__*` environment variables, e.g.
//! `TRIBUTARY__EXECUTOR__MAX_PARALLEL=16` or
//! `TRIBUTARY__SCHEDULER__POLL_INTERVAL=2s`.

use crate::error::{Result, TributaryError};
use crate::executor::ExecutorConfig;
use crate::logging::LogConfig;
use crate::scheduler::SchedulerConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "TRIBUTARY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub db_path: PathBuf,
    /// Directory of workflow definitions loaded by the daemon
    pub workflows_dir: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub metrics: MetricsConfig,
    pub log: LogConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tributary.db"),
            workflows_dir: None,
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            metrics: MetricsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// `Config` if the file is unreadable or a value has the wrong type,
    /// `Validation` if a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: OrchestratorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: Duration| {
            if value.is_zero() {
                Err(TributaryError::Validation(format!("{} must be greater than zero", name)))
            } else {
                Ok(())
            }
        };

        positive("scheduler.poll_interval", self.scheduler.poll_interval)?;
        positive("scheduler.heartbeat_timeout", self.scheduler.heartbeat_timeout)?;
        positive("scheduler.queued_timeout", self.scheduler.queued_timeout)?;
        positive("executor.heartbeat_interval", self.executor.heartbeat_interval)?;

        if self.executor.max_parallel == 0 {
            return Err(TributaryError::Validation(
                "executor.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_catchup_runs == 0 {
            return Err(TributaryError::Validation(
                "scheduler.max_catchup_runs must be at least 1".to_string(),
            ));
        }
        // Reclaiming must not race a healthy worker's next beat
        if self.scheduler.heartbeat_timeout <= self.executor.heartbeat_interval {
            return Err(TributaryError::Validation(format!(
                "scheduler.heartbeat_timeout ({}) must exceed executor.heartbeat_interval ({})",
                humantime::format_duration(self.scheduler.heartbeat_timeout),
                humantime::format_duration(self.executor.heartbeat_interval)
            )));
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(TributaryError::Validation(
                "metrics.port must be set when metrics are enabled".to_string(),
            ));
        }

        Ok(())
    }
}
