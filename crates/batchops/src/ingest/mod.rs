//! Upload ingest generators and maintenance callables
//!
//! Ingest generators synthesise fresh uploads from department feeds: read
//! the newest records, write a CSV under a new upload directory, create
//! the upload row in `pending`, enqueue a pipeline execution, and return
//! as soon as the enqueue succeeds.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{IngestConfig, StorageConfig};
use crate::errors::{EngineError, EngineResult};
use crate::job_scheduling::JobQueue;
use crate::models::{DepartmentRecord, DepartmentSource, ProcessMode, Upload, UploadCreate};
use crate::pipeline::table::format_numeric;
use crate::pipeline::PIPELINE_JOB_NAME;
use crate::repositories::{DepartmentRepo, IncidentRepo, JobRepo, JobRunRepo, Repos, UploadRepo};
use crate::utils::clock::Clock;

const RECORD_COLUMNS: [&str; 7] = [
    "student_id",
    "student_name",
    "class",
    "score",
    "attendance_percent",
    "status",
    "recorded_at",
];

pub struct IngestService {
    repos: Repos,
    queue: Arc<JobQueue>,
    storage: StorageConfig,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
}

impl IngestService {
    pub fn new(
        repos: Repos,
        queue: Arc<JobQueue>,
        storage: StorageConfig,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repos,
            queue,
            storage,
            config,
            clock,
        }
    }

    /// Ingest the newest records of one department feed
    pub async fn ingest_department(&self, department: &str) -> EngineResult<String> {
        let Some(source) = self.repos.departments.find_source(department).await? else {
            let message = format!("No department source found for {department}.");
            warn!("{message}");
            return Ok(message);
        };

        let records = self
            .repos
            .departments
            .records_for_source(source.id, self.config.per_source_limit)
            .await?;
        if records.is_empty() {
            return Ok(format!("No records available for {}.", source.name));
        }

        let timestamp = self.clock.now();
        let filename = format!(
            "{}-ingest-{}.csv",
            source.code.to_lowercase(),
            timestamp.format("%Y%m%d-%H%M")
        );

        let upload = self
            .repos
            .uploads
            .create(
                UploadCreate {
                    department: source.name.clone(),
                    filename: filename.clone(),
                    notes: Some("Automated department ingest".to_string()),
                    process_mode: ProcessMode::Transform,
                    process_config: serde_json::json!({
                        "source": source.code,
                        "source_name": source.name,
                    }),
                },
                timestamp,
            )
            .await?;

        let rows: Vec<Vec<String>> = records.iter().map(|r| record_row(r, None)).collect();
        self.write_upload_csv(&upload, &filename, &RECORD_COLUMNS, &rows)
            .await?;

        self.repos
            .departments
            .set_last_ingested(source.id, timestamp)
            .await?;
        self.enqueue_pipeline(&upload).await?;

        let message = format!(
            "Ingested {} records from {} and started processing.",
            records.len(),
            source.name
        );
        info!("{message}");
        Ok(message)
    }

    /// Merge every active feed into one upload with a department column
    pub async fn ingest_all_departments(&self) -> EngineResult<String> {
        let sources = self.repos.departments.list_active_sources().await?;
        if sources.is_empty() {
            let message = "No active department sources to ingest.".to_string();
            warn!("{message}");
            return Ok(message);
        }

        let timestamp = self.clock.now();
        let filename = format!(
            "all-departments-ingest-{}.csv",
            timestamp.format("%Y%m%d-%H%M")
        );

        let upload = self
            .repos
            .uploads
            .create(
                UploadCreate {
                    department: "All Departments".to_string(),
                    filename: filename.clone(),
                    notes: Some("Automated all-departments ingest".to_string()),
                    process_mode: ProcessMode::Transform,
                    process_config: serde_json::json!({
                        "source": "ALL",
                        "source_names": sources.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
                        "per_source_limit": self.config.per_source_limit,
                    }),
                },
                timestamp,
            )
            .await?;

        let mut columns = vec!["department".to_string()];
        columns.extend(RECORD_COLUMNS.iter().map(|c| c.to_string()));

        let mut rows = Vec::new();
        let mut total = 0usize;
        let mut failures = Vec::new();
        for source in &sources {
            let records = self
                .repos
                .departments
                .records_for_source(source.id, self.config.per_source_limit)
                .await?;
            if records.is_empty() {
                failures.push(format!("{}: no records", source.name));
                continue;
            }
            total += records.len();
            for record in &records {
                rows.push(record_row(record, Some(source)));
            }
            self.repos
                .departments
                .set_last_ingested(source.id, timestamp)
                .await?;
        }

        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        self.write_upload_csv(&upload, &filename, &column_refs, &rows)
            .await?;
        self.enqueue_pipeline(&upload).await?;

        let mut summary = format!(
            "All departments ingest started ({} sources, {} records).",
            sources.len(),
            total
        );
        if !failures.is_empty() {
            summary = format!("{summary} Issues: {}", failures.join(", "));
        }
        info!("{summary}");
        Ok(summary)
    }

    /// Delete runs and incidents older than the configured horizon
    pub async fn purge_history(&self, days: Option<i64>) -> EngineResult<String> {
        let days = days.unwrap_or(self.config.purge_after_days);
        let cutoff = self.clock.now() - Duration::days(days);
        let runs = self.repos.runs.purge_finished_before(cutoff).await?;
        let incidents = self.repos.incidents.purge_created_before(cutoff).await?;
        let message = format!(
            "Purged {runs} job runs and {incidents} incidents older than {days} days."
        );
        info!("{message}");
        Ok(message)
    }

    async fn write_upload_csv(
        &self,
        upload: &Upload,
        filename: &str,
        columns: &[&str],
        rows: &[Vec<String>],
    ) -> EngineResult<()> {
        let dir = self.storage.upload_dir(upload.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(columns)
            .map_err(|e| EngineError::internal(format!("ingest CSV write failed: {e}")))?;
        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| EngineError::internal(format!("ingest CSV write failed: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| EngineError::internal(format!("ingest CSV flush failed: {e}")))?;
        tokio::fs::write(&path, bytes).await?;

        self.repos
            .uploads
            .set_file_path(upload.id, &path.to_string_lossy())
            .await?;
        Ok(())
    }

    async fn enqueue_pipeline(&self, upload: &Upload) -> EngineResult<()> {
        let Some(job) = self.repos.jobs.find_by_name(PIPELINE_JOB_NAME).await? else {
            return Err(EngineError::internal(format!(
                "pipeline job '{PIPELINE_JOB_NAME}' is not registered"
            )));
        };
        self.queue
            .enqueue(
                job.id,
                vec![serde_json::Value::String(upload.id.to_string())],
                serde_json::Map::new(),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }
}

fn record_row(record: &DepartmentRecord, source: Option<&DepartmentSource>) -> Vec<String> {
    let mut row = Vec::with_capacity(8);
    if let Some(source) = source {
        row.push(source.name.clone());
    }
    row.extend([
        record.student_id.clone(),
        record.student_name.clone(),
        record.class_name.clone(),
        record.score.map(format_numeric).unwrap_or_default(),
        record
            .attendance_percent
            .map(format_numeric)
            .unwrap_or_default(),
        record.status.clone(),
        format_recorded_at(record.recorded_at),
    ]);
    row
}

fn format_recorded_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}
