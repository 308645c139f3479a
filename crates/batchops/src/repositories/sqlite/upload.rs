//! Upload table queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{get_uuid, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{ProcessMode, ReportArtifacts, Upload, UploadCreate, UploadStatus};
use crate::repositories::traits::UploadRepo;
use crate::utils::datetime::{parse_datetime, parse_datetime_opt};

const UPLOAD_COLUMNS: &str = "id, department, filename, file_path, notes, status, process_mode, \
     process_config, received_at, report_csv, report_pdf, report_meta, report_generated_at";

pub(crate) fn map_upload(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<Upload> {
    let status_raw: String = row.get("status");
    let mode_raw: String = row.get("process_mode");
    let config_raw: String = row.get("process_config");
    let meta_raw: Option<String> = row.get("report_meta");
    let received_at: String = row.get("received_at");

    Ok(Upload {
        id: get_uuid(row, "id")?,
        department: row.get("department"),
        filename: row.get("filename"),
        file_path: row.get("file_path"),
        notes: row.get("notes"),
        status: UploadStatus::parse(&status_raw).unwrap_or(UploadStatus::Pending),
        process_mode: ProcessMode::parse(&mode_raw).unwrap_or_default(),
        process_config: serde_json::from_str(&config_raw)?,
        received_at: parse_datetime(&received_at)?,
        report_csv: row.get("report_csv"),
        report_pdf: row.get("report_pdf"),
        report_meta: meta_raw.map(|m| serde_json::from_str(&m)).transpose()?,
        report_generated_at: parse_datetime_opt(row.get("report_generated_at"))?,
    })
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn create(
        &self,
        request: UploadCreate,
        received_at: DateTime<Utc>,
    ) -> RepositoryResult<Upload> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO uploads (id, department, filename, notes, status, process_mode, \
             process_config, received_at) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&request.department)
        .bind(&request.filename)
        .bind(&request.notes)
        .bind(request.process_mode.as_str())
        .bind(request.process_config.to_string())
        .bind(received_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(Upload {
            id,
            department: request.department,
            filename: request.filename,
            file_path: None,
            notes: request.notes,
            status: UploadStatus::Pending,
            process_mode: request.process_mode,
            process_config: request.process_config,
            received_at,
            report_csv: None,
            report_pdf: None,
            report_meta: None,
            report_generated_at: None,
        })
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Upload>> {
        let row = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(map_upload).transpose()
    }

    async fn set_file_path(&self, id: Uuid, path: &str) -> RepositoryResult<()> {
        sqlx::query("UPDATE uploads SET file_path = ? WHERE id = ?")
            .bind(path)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: UploadStatus) -> RepositoryResult<()> {
        // Leaving `published` always drops the artifacts with the status.
        if status == UploadStatus::Published {
            sqlx::query("UPDATE uploads SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(id.to_string())
                .execute(self.pool())
                .await?;
        } else {
            sqlx::query(
                "UPDATE uploads SET status = ?, report_csv = NULL, report_pdf = NULL, \
                 report_meta = NULL, report_generated_at = NULL WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    async fn store_report(&self, id: Uuid, artifacts: ReportArtifacts) -> RepositoryResult<()> {
        sqlx::query(
            "UPDATE uploads SET status = 'published', report_csv = ?, report_pdf = ?, \
             report_meta = ?, report_generated_at = ? WHERE id = ?",
        )
        .bind(&artifacts.csv)
        .bind(&artifacts.pdf)
        .bind(artifacts.meta.to_string())
        .bind(artifacts.generated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
