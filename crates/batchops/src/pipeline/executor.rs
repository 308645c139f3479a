//! Pipeline executor
//!
//! Drives one upload through standardize -> validate -> transform ->
//! summarize -> publish, recording an append-only StepRecord per stage on
//! the run. Execution is driven by the upload's status, which is what
//! makes redelivery safe: a published upload no-ops, a processing upload
//! resumes behind an advisory lock, and artifact writes are overwrites.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::loader::load_table;
use super::report::{build_pdf_table, render_csv};
use super::stages::{summarize, transform, validate, Summary};
use super::table::Table;
use crate::config::{PipelineConfig, StorageConfig};
use crate::errors::{EngineError, EngineResult, StageError};
use crate::incidents::IncidentWriter;
use crate::job_scheduling::JobContext;
use crate::kv::KvStore;
use crate::models::{
    JobRunStatus, ReportArtifacts, RunFinalize, StepRecord, StepStatus, Upload, UploadStatus,
};
use crate::repositories::{JobRepo, JobRunRepo, Repos, UploadRepo};
use crate::utils::clock::Clock;

/// Name of the job definition every pipeline run belongs to
pub const PIPELINE_JOB_NAME: &str = "report_pipeline";

/// The fixed stage order
pub const PIPELINE_STAGES: [&str; 5] =
    ["standardize", "validate", "transform", "summarize", "publish"];

/// In-flight dataflow between stages
#[derive(Default)]
struct PipelineData {
    table: Option<Table>,
    summary: Option<Summary>,
}

impl PipelineData {
    fn table_mut(&mut self) -> Result<&mut Table, StageError> {
        self.table.as_mut().ok_or_else(|| StageError::Internal {
            message: "no table loaded".to_string(),
        })
    }
}

pub struct PipelineExecutor {
    repos: Repos,
    kv: Arc<dyn KvStore>,
    incidents: Arc<IncidentWriter>,
    storage: StorageConfig,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl PipelineExecutor {
    pub fn new(
        repos: Repos,
        kv: Arc<dyn KvStore>,
        incidents: Arc<IncidentWriter>,
        storage: StorageConfig,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repos,
            kv,
            incidents,
            storage,
            config,
            clock,
        }
    }

    /// Execute the pipeline for an upload within the given run context
    pub async fn execute(&self, upload_id: Uuid, ctx: &JobContext) -> EngineResult<String> {
        let Some(upload) = self.repos.uploads.find_by_id(upload_id).await? else {
            return Err(EngineError::internal(format!(
                "upload {upload_id} does not exist"
            )));
        };

        if upload.status == UploadStatus::Published && upload.has_reports() {
            info!("Upload {} already published; nothing to do", upload_id);
            return Ok("Upload already published; nothing to do".to_string());
        }

        let lock_key = format!("lock:upload:{upload_id}");
        let acquired = self
            .kv
            .compare_and_swap(&lock_key, None, Some(ctx.run_id.to_string()))
            .await?;
        if !acquired {
            info!("Upload {} is being processed elsewhere; bailing", upload_id);
            return Ok("Upload is already being processed; bailing".to_string());
        }

        let result = self.run_locked(upload, ctx).await;

        if let Err(e) = self.kv.delete(&lock_key).await {
            warn!("Failed to release upload lock {}: {}", lock_key, e);
        }
        result
    }

    async fn run_locked(&self, upload: Upload, ctx: &JobContext) -> EngineResult<String> {
        let resume_from = self.resume_index(&upload).await?;
        if resume_from > 0 {
            info!(
                "Resuming upload {} from stage '{}'",
                upload.id, PIPELINE_STAGES[resume_from]
            );
        }

        self.repos
            .uploads
            .set_status(upload.id, UploadStatus::Processing)
            .await?;
        self.repos.runs.set_upload(ctx.run_id, upload.id).await?;

        let started_at = self
            .repos
            .runs
            .find_by_id(ctx.run_id)
            .await?
            .and_then(|r| r.started_at)
            .unwrap_or_else(|| self.clock.now());

        let mut data = PipelineData::default();
        let mut details: Vec<StepRecord> = Vec::with_capacity(PIPELINE_STAGES.len());
        let mut log_lines: Vec<String> = Vec::new();

        for (index, stage) in PIPELINE_STAGES.iter().enumerate() {
            let stage_started = self.clock.now();
            details.push(StepRecord {
                name: stage.to_string(),
                status: StepStatus::Running,
                started_at: stage_started,
                finished_at: None,
                logs: String::new(),
            });
            self.repos
                .runs
                .update_details(ctx.run_id, details.clone())
                .await?;

            let outcome = match tokio::time::timeout(
                self.config.stage_timeout(),
                self.run_stage(index, &mut data, &upload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::Timeout {
                    seconds: self.config.stage_timeout().as_secs(),
                }),
            };

            let finished = self.clock.now();
            let step = details.last_mut().expect("step pushed above");
            step.finished_at = Some(finished);

            match outcome {
                Ok(log) => {
                    // Stages before the resume point were completed by the
                    // prior run; their replay is bookkeeping, not progress.
                    if index < resume_from {
                        step.status = StepStatus::Skipped;
                        step.logs = format!("Carried over from prior run. {log}");
                    } else {
                        step.status = StepStatus::Success;
                        step.logs = log;
                    }
                    log_lines.push(format!("[{stage}] {}", step.logs));
                    self.repos
                        .runs
                        .update_details(ctx.run_id, details.clone())
                        .await?;
                }
                Err(error) => {
                    step.status = StepStatus::Failed;
                    step.logs = error.to_string();
                    log_lines.push(format!("[{stage}] {error}"));
                    self.fail(&upload, stage, error, ctx.run_id, started_at, details, log_lines)
                        .await?;
                    return Ok(format!("Pipeline failed at stage '{stage}'"));
                }
            }
        }

        let finished_at = self.clock.now();
        self.repos
            .runs
            .finalize(RunFinalize {
                run_id: ctx.run_id,
                status: JobRunStatus::Success,
                finished_at,
                duration_ms: (finished_at - started_at).num_milliseconds(),
                exit_code: 0,
                details,
                logs: log_lines.join("\n"),
            })
            .await?;

        let resolved = self.incidents.handle_pipeline_success(upload.id).await?;
        if resolved > 0 {
            info!(
                "Auto-resolved {} incident(s) for upload {}",
                resolved, upload.id
            );
        }

        Ok(format!(
            "Published report for upload {} ({} stages)",
            upload.id,
            PIPELINE_STAGES.len()
        ))
    }

    /// Finalise the failed run and hand off to the incident writer
    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        upload: &Upload,
        stage: &str,
        error: StageError,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        details: Vec<StepRecord>,
        mut log_lines: Vec<String>,
    ) -> EngineResult<()> {
        warn!("Upload {} failed at {}: {}", upload.id, stage, error);
        self.repos
            .uploads
            .set_status(upload.id, UploadStatus::Failed)
            .await?;

        let finished_at = self.clock.now();
        log_lines.push(format!("{stage} failed: {error}"));

        let finalize = RunFinalize {
            run_id,
            status: JobRunStatus::Failed,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            exit_code: 1,
            details,
            logs: log_lines.join("\n"),
        };

        self.incidents
            .record_pipeline_failure(upload, stage, &error, finalize)
            .await?;
        Ok(())
    }

    /// First stage of the most recent prior run that did not succeed
    ///
    /// Publish is never skipped: if every prior step reads success but the
    /// upload is still processing, the artifacts did not land.
    async fn resume_index(&self, upload: &Upload) -> EngineResult<usize> {
        if upload.status != UploadStatus::Processing {
            return Ok(0);
        }
        let Some(job) = self.repos.jobs.find_by_name(PIPELINE_JOB_NAME).await? else {
            return Ok(0);
        };
        let Some(prior) = self
            .repos
            .runs
            .latest_for_upload(upload.id, job.id)
            .await?
        else {
            return Ok(0);
        };

        let mut resume = 0;
        for (index, stage) in PIPELINE_STAGES.iter().enumerate() {
            let succeeded = prior
                .details
                .iter()
                .any(|s| s.name == *stage && s.status == StepStatus::Success);
            if succeeded {
                resume = index + 1;
            } else {
                break;
            }
        }
        Ok(resume.min(PIPELINE_STAGES.len() - 1))
    }

    async fn run_stage(
        &self,
        index: usize,
        data: &mut PipelineData,
        upload: &Upload,
    ) -> Result<String, StageError> {
        match index {
            0 => {
                let path = upload
                    .file_path
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| StageError::FileNotFound {
                        path: "<no file recorded for upload>".to_string(),
                    })?;
                let mut table = load_table(path).await?;
                table.normalize_columns();
                table.tidy();
                let log = format!(
                    "Loaded {} rows, {} cols",
                    table.row_count(),
                    table.col_count()
                );
                data.table = Some(table);
                Ok(log)
            }
            1 => {
                let required = self.config.required_columns_for(&upload.department);
                validate(data.table_mut()?, required)
            }
            2 => transform(data.table_mut()?, upload),
            3 => {
                let table = data.table_mut()?;
                let summary = summarize(table, upload);
                let log = format!(
                    "Summary built. Numeric cols: {}",
                    summary.numeric_columns.len()
                );
                data.summary = Some(summary);
                Ok(log)
            }
            4 => self.publish(data, upload).await,
            _ => Err(StageError::Internal {
                message: format!("unknown stage index {index}"),
            }),
        }
    }

    /// Write artifacts to the export directory and onto the upload row
    async fn publish(&self, data: &mut PipelineData, upload: &Upload) -> Result<String, StageError> {
        let summary = data.summary.as_ref().ok_or_else(|| StageError::Internal {
            message: "no summary built".to_string(),
        })?;
        let table = data.table.as_ref().ok_or_else(|| StageError::Internal {
            message: "no table loaded".to_string(),
        })?;

        let export_dir = self.storage.export_dir();
        tokio::fs::create_dir_all(&export_dir)
            .await
            .map_err(publish_write_error)?;

        // Transform mode publishes the canonical summary; the plan-driven
        // modes publish the processed dataset itself.
        let (prefix, columns, rows): (&str, Vec<String>, Vec<Vec<String>>) =
            if upload.process_mode == crate::models::ProcessMode::Transform {
                (
                    "summary",
                    vec!["field".to_string(), "value".to_string()],
                    summary
                        .summary_rows
                        .iter()
                        .map(|(field, value)| vec![field.clone(), value.clone()])
                        .collect(),
                )
            } else {
                ("processed", table.columns.clone(), table.rows.clone())
            };

        let csv_text = render_csv(&columns, &rows)?;
        let csv_path = export_dir.join(format!("{}-{prefix}.csv", upload.id));
        tokio::fs::write(&csv_path, csv_text.as_bytes())
            .await
            .map_err(publish_write_error)?;

        let pdf_bytes = build_pdf_table(&format!("Upload {}", upload.id), &columns, &rows)?;
        let pdf_path = export_dir.join(format!("{}-{prefix}.pdf", upload.id));
        tokio::fs::write(&pdf_path, &pdf_bytes)
            .await
            .map_err(publish_write_error)?;

        let mut meta = summary.to_meta();
        if let Some(object) = meta.as_object_mut() {
            object.insert(
                "process_mode".to_string(),
                serde_json::Value::String(upload.process_mode.as_str().to_string()),
            );
            object.insert(
                "export_csv".to_string(),
                serde_json::Value::String(csv_path.to_string_lossy().into_owned()),
            );
        }

        self.repos
            .uploads
            .store_report(
                upload.id,
                ReportArtifacts {
                    csv: csv_text,
                    pdf: pdf_bytes,
                    meta,
                    generated_at: self.clock.now(),
                },
            )
            .await
            .map_err(|e| StageError::Internal {
                message: format!("write failure: {e}"),
            })?;

        Ok(format!("Published export: {}", csv_path.display()))
    }
}

fn publish_write_error(error: std::io::Error) -> StageError {
    StageError::Internal {
        message: format!("write failure: {error}"),
    }
}
