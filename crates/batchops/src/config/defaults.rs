//! Default values for configuration fields

use std::path::PathBuf;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://batchops.db";
pub const DEFAULT_STORAGE_ROOT: &str = "./storage";
pub const DEFAULT_REFERENCE_ZONE: &str = "UTC";

pub fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

pub fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_ROOT)
}

pub fn default_reference_zone() -> String {
    DEFAULT_REFERENCE_ZONE.to_string()
}

pub fn default_tick_interval_secs() -> u64 {
    10
}

pub fn default_worker_count() -> usize {
    4
}

pub fn default_lease_secs() -> u64 {
    600
}

pub fn default_poll_interval_secs() -> u64 {
    5
}

pub fn default_shutdown_grace_secs() -> u64 {
    30
}

pub fn default_stage_timeout_secs() -> u64 {
    600
}

pub fn default_required_columns() -> Vec<String> {
    vec!["student_id".to_string(), "score".to_string()]
}

pub fn default_per_source_limit() -> usize {
    250
}

pub fn default_purge_after_days() -> i64 {
    90
}
