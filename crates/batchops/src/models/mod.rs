//! Domain model types for the BatchOps engine
//!
//! These mirror the durable tables the engine reads and writes. Status
//! enums carry explicit string forms because the SQL store keeps them as
//! TEXT columns and the repositories map rows by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an uploaded data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Processing,
    Published,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Processing => "processing",
            UploadStatus::Published => "published",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "processing" => Some(UploadStatus::Processing),
            "published" => Some(UploadStatus::Published),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

/// Operator-selected processing mode for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    #[default]
    Transform,
    Append,
    Delete,
    Custom,
}

impl ProcessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::Transform => "transform",
            ProcessMode::Append => "append",
            ProcessMode::Delete => "delete",
            ProcessMode::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transform" => Some(ProcessMode::Transform),
            "append" => Some(ProcessMode::Append),
            "delete" => Some(ProcessMode::Delete),
            "custom" => Some(ProcessMode::Custom),
            _ => None,
        }
    }
}

/// A departmental data file moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub department: String,
    pub filename: String,
    /// Absolute path of the stored source file under the storage root
    pub file_path: Option<String>,
    pub notes: Option<String>,
    pub status: UploadStatus,
    pub process_mode: ProcessMode,
    pub process_config: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub report_csv: Option<String>,
    pub report_pdf: Option<Vec<u8>>,
    pub report_meta: Option<serde_json::Value>,
    pub report_generated_at: Option<DateTime<Utc>>,
}

impl Upload {
    /// A published upload always carries both report artifacts
    pub fn has_reports(&self) -> bool {
        self.report_csv.is_some() && self.report_pdf.is_some()
    }
}

/// Request model for creating an upload row
#[derive(Debug, Clone)]
pub struct UploadCreate {
    pub department: String,
    pub filename: String,
    pub notes: Option<String>,
    pub process_mode: ProcessMode,
    pub process_config: serde_json::Value,
}

/// Published report artifacts written back onto the upload in one shot
#[derive(Debug, Clone)]
pub struct ReportArtifacts {
    pub csv: String,
    pub pdf: Vec<u8>,
    pub meta: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

/// Callable binding stored in a job's config payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Symbolic `namespace.function` identifier resolved at run time
    pub callable: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl JobConfig {
    pub fn new(callable: &str) -> Self {
        Self {
            callable: callable.to_string(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }
}

/// A named job definition, optionally bound to a cron schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub config: JobConfig,
    /// 5-field cron expression; `None` means manual-trigger only
    pub schedule_cron: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request model for creating a job row
#[derive(Debug, Clone)]
pub struct JobCreate {
    pub name: String,
    pub job_type: String,
    pub config: JobConfig,
    pub schedule_cron: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Retrying,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Queued => "queued",
            JobRunStatus::Running => "running",
            JobRunStatus::Success => "success",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobRunStatus::Queued),
            "running" => Some(JobRunStatus::Running),
            "success" => Some(JobRunStatus::Success),
            "failed" => Some(JobRunStatus::Failed),
            "retrying" => Some(JobRunStatus::Retrying),
            _ => None,
        }
    }

    /// Terminal states carry a `finished_at` timestamp
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobRunStatus::Success | JobRunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Per-stage telemetry embedded in a job run, append-only within the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: String,
}

/// One execution of a callable, with step telemetry for pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub upload_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub details: Vec<StepRecord>,
    pub logs: String,
}

/// Finalisation payload applied when a run reaches a terminal state
#[derive(Debug, Clone)]
pub struct RunFinalize {
    pub run_id: Uuid,
    pub status: JobRunStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub details: Vec<StepRecord>,
    pub logs: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// A regex-plus-metadata rule used to classify failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownError {
    pub id: Uuid,
    pub name: String,
    /// Regex evaluated as a substring match against the failure message
    pub pattern: String,
    pub severity: Severity,
    pub category: String,
    pub corrective_action: Option<String>,
    pub root_cause: Option<String>,
    pub resolution_report: Option<String>,
    pub auto_retry: bool,
    pub max_auto_retries: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request model for seeding or creating a known-error rule
#[derive(Debug, Clone)]
pub struct KnownErrorCreate {
    pub name: String,
    pub pattern: String,
    pub severity: Severity,
    pub category: String,
    pub corrective_action: Option<String>,
    pub root_cause: Option<String>,
    pub resolution_report: Option<String>,
    pub auto_retry: bool,
    pub max_auto_retries: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Open,
    InProgress,
    Resolved,
    Archived,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Open => "open",
            IncidentState::InProgress => "in_progress",
            IncidentState::Resolved => "resolved",
            IncidentState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IncidentState::Open),
            "in_progress" => Some(IncidentState::InProgress),
            "resolved" => Some(IncidentState::Resolved),
            "archived" => Some(IncidentState::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Engine,
    Manual,
}

impl DetectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionSource::Engine => "engine",
            DetectionSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engine" => Some(DetectionSource::Engine),
            "manual" => Some(DetectionSource::Manual),
            _ => None,
        }
    }
}

/// Append-only audit record on an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub event: String,
    pub notes: Option<String>,
}

/// A durable record of a pipeline failure with workflow state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub job_run_id: Option<Uuid>,
    /// The failing pipeline step; the one-open rule is keyed on (upload, stage)
    pub stage: String,
    pub state: IncidentState,
    pub severity: Severity,
    pub category: Option<String>,
    pub error: String,
    pub root_cause: Option<String>,
    pub corrective_action: Option<String>,
    pub impact_summary: Option<String>,
    pub analysis_notes: Option<String>,
    pub resolution_report: Option<String>,
    pub matched_known_error: Option<Uuid>,
    pub is_known: bool,
    pub auto_retry_count: i32,
    pub max_auto_retries: i32,
    pub detection_source: DetectionSource,
    pub assignee: Option<String>,
    pub resolved_by: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

/// A registered departmental feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentSource {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub description: String,
    pub active: bool,
    pub last_ingested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A single row from a departmental feed; read-only to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub student_id: String,
    pub student_name: String,
    pub class_name: String,
    pub score: Option<f64>,
    pub attendance_percent: Option<f64>,
    pub status: String,
    pub recorded_at: DateTime<Utc>,
}
