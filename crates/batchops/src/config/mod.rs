//! Engine configuration
//!
//! Loaded from a TOML file with `BATCHOPS_`-prefixed environment overrides
//! layered on top. Every field has a default so an empty file is a valid
//! configuration.

use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod defaults;

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for uploaded sources and published exports
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl StorageConfig {
    /// Per-upload source directory: `<root>/uploads/<upload_id>/`
    pub fn upload_dir(&self, upload_id: uuid::Uuid) -> PathBuf {
        self.root.join("uploads").join(upload_id.to_string())
    }

    /// Shared directory for published artifacts
    pub fn export_dir(&self) -> PathBuf {
        self.root.join("exports")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Reference zone cron expressions are evaluated in. The engine stores
    /// and schedules in UTC; converting for display happens outside the
    /// core, so only "UTC" is accepted here.
    #[serde(default = "default_reference_zone")]
    pub reference_zone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            reference_zone: default_reference_zone(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            lease_secs: default_lease_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Soft per-stage timeout
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Columns every upload must carry after standardization
    #[serde(default = "default_required_columns")]
    pub required_columns: Vec<String>,
    /// Department-specific overrides of the required column set
    #[serde(default)]
    pub required_columns_by_department: HashMap<String, Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            required_columns: default_required_columns(),
            required_columns_by_department: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn required_columns_for(&self, department: &str) -> &[String] {
        self.required_columns_by_department
            .get(department)
            .unwrap_or(&self.required_columns)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Newest-first record cap per source and ingest run
    #[serde(default = "default_per_source_limit")]
    pub per_source_limit: usize,
    /// History horizon for the purge maintenance job
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            per_source_limit: default_per_source_limit(),
            purge_after_days: default_purge_after_days(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file plus environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BATCHOPS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scheduler.reference_zone != "UTC" {
            anyhow::bail!(
                "unsupported reference zone '{}': the engine evaluates schedules in UTC",
                self.scheduler.reference_zone
            );
        }
        if self.workers.count == 0 {
            anyhow::bail!("workers.count must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.workers.lease_secs, 600);
        assert_eq!(config.scheduler.tick_interval_secs, 10);
        assert_eq!(config.pipeline.stage_timeout_secs, 600);
        assert_eq!(
            config.pipeline.required_columns,
            vec!["student_id", "score"]
        );
    }

    #[test]
    fn department_override_falls_back_to_default() {
        let mut config = Config::default();
        config.pipeline.required_columns_by_department.insert(
            "Examination".to_string(),
            vec!["student_id".to_string(), "subject".to_string()],
        );
        assert_eq!(
            config.pipeline.required_columns_for("Examination"),
            &["student_id".to_string(), "subject".to_string()]
        );
        assert_eq!(
            config.pipeline.required_columns_for("General"),
            &["student_id".to_string(), "score".to_string()]
        );
    }
}
