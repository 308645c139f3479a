//! Job run table queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{get_json, get_uuid, get_uuid_opt, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{JobRun, JobRunStatus, RunFinalize, StepRecord};
use crate::repositories::traits::JobRunRepo;
use crate::utils::datetime::parse_datetime_opt;

const RUN_COLUMNS: &str = "id, job_id, upload_id, status, started_at, finished_at, duration_ms, \
     exit_code, details, logs";

fn map_run(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<JobRun> {
    let status_raw: String = row.get("status");
    Ok(JobRun {
        id: get_uuid(row, "id")?,
        job_id: get_uuid(row, "job_id")?,
        upload_id: get_uuid_opt(row, "upload_id")?,
        status: JobRunStatus::parse(&status_raw).unwrap_or(JobRunStatus::Queued),
        started_at: parse_datetime_opt(row.get("started_at"))?,
        finished_at: parse_datetime_opt(row.get("finished_at"))?,
        duration_ms: row.get("duration_ms"),
        exit_code: row.get("exit_code"),
        details: get_json(row, "details")?,
        logs: row.get("logs"),
    })
}

/// Shared by the plain finalize path and the atomic failure transaction
pub(crate) async fn exec_finalize_run(
    conn: &mut SqliteConnection,
    finalize: &RunFinalize,
) -> RepositoryResult<()> {
    sqlx::query(
        "UPDATE job_runs SET status = ?, finished_at = ?, duration_ms = ?, exit_code = ?, \
         details = ?, logs = ? WHERE id = ?",
    )
    .bind(finalize.status.as_str())
    .bind(finalize.finished_at.to_rfc3339())
    .bind(finalize.duration_ms)
    .bind(finalize.exit_code)
    .bind(serde_json::to_string(&finalize.details)?)
    .bind(&finalize.logs)
    .bind(finalize.run_id.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl JobRunRepo for SqliteStore {
    async fn create_running(
        &self,
        job_id: Uuid,
        upload_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<JobRun> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO job_runs (id, job_id, upload_id, status, started_at) \
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(id.to_string())
        .bind(job_id.to_string())
        .bind(upload_id.map(|u| u.to_string()))
        .bind(started_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(JobRun {
            id,
            job_id,
            upload_id,
            status: JobRunStatus::Running,
            started_at: Some(started_at),
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            details: Vec::new(),
            logs: String::new(),
        })
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<JobRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_run).transpose()
    }

    async fn set_upload(&self, run_id: Uuid, upload_id: Uuid) -> RepositoryResult<()> {
        sqlx::query("UPDATE job_runs SET upload_id = ? WHERE id = ?")
            .bind(upload_id.to_string())
            .bind(run_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn update_details(&self, run_id: Uuid, details: Vec<StepRecord>) -> RepositoryResult<()> {
        sqlx::query("UPDATE job_runs SET details = ? WHERE id = ?")
            .bind(serde_json::to_string(&details)?)
            .bind(run_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn finalize(&self, finalize: RunFinalize) -> RepositoryResult<()> {
        let mut conn = self.pool().acquire().await?;
        exec_finalize_run(&mut *conn, &finalize).await
    }

    async fn latest_for_upload(
        &self,
        upload_id: Uuid,
        job_id: Uuid,
    ) -> RepositoryResult<Option<JobRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE upload_id = ? AND job_id = ? \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(upload_id.to_string())
        .bind(job_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_run).transpose()
    }

    async fn latest_for_job(&self, job_id: Uuid) -> RepositoryResult<Option<JobRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ? \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(job_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_run).transpose()
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM job_runs WHERE finished_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
