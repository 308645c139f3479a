//! Known-error library queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{get_uuid, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{KnownError, KnownErrorCreate, Severity};
use crate::repositories::traits::KnownErrorRepo;
use crate::utils::datetime::parse_datetime;

const KNOWN_ERROR_COLUMNS: &str = "id, name, pattern, severity, category, corrective_action, \
     root_cause, resolution_report, auto_retry, max_auto_retries, active, created_at";

fn map_known_error(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<KnownError> {
    let severity_raw: String = row.get("severity");
    let created_at: String = row.get("created_at");
    Ok(KnownError {
        id: get_uuid(row, "id")?,
        name: row.get("name"),
        pattern: row.get("pattern"),
        severity: Severity::parse(&severity_raw).unwrap_or(Severity::Medium),
        category: row.get("category"),
        corrective_action: row.get("corrective_action"),
        root_cause: row.get("root_cause"),
        resolution_report: row.get("resolution_report"),
        auto_retry: row.get("auto_retry"),
        max_auto_retries: row.get("max_auto_retries"),
        active: row.get("active"),
        created_at: parse_datetime(&created_at)?,
    })
}

#[async_trait]
impl KnownErrorRepo for SqliteStore {
    async fn list_active(&self) -> RepositoryResult<Vec<KnownError>> {
        let rows = sqlx::query(&format!(
            "SELECT {KNOWN_ERROR_COLUMNS} FROM known_errors WHERE active = 1 \
             ORDER BY created_at, id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_known_error).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<KnownError>> {
        let row = sqlx::query(&format!(
            "SELECT {KNOWN_ERROR_COLUMNS} FROM known_errors WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_known_error).transpose()
    }

    async fn get_or_create(
        &self,
        request: KnownErrorCreate,
        now: DateTime<Utc>,
    ) -> RepositoryResult<KnownError> {
        if let Some(row) = sqlx::query(&format!(
            "SELECT {KNOWN_ERROR_COLUMNS} FROM known_errors WHERE pattern = ?"
        ))
        .bind(&request.pattern)
        .fetch_optional(self.pool())
        .await?
        {
            return map_known_error(&row);
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO known_errors (id, name, pattern, severity, category, \
             corrective_action, root_cause, resolution_report, auto_retry, max_auto_retries, \
             active, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(id.to_string())
        .bind(&request.name)
        .bind(&request.pattern)
        .bind(request.severity.as_str())
        .bind(&request.category)
        .bind(&request.corrective_action)
        .bind(&request.root_cause)
        .bind(&request.resolution_report)
        .bind(request.auto_retry)
        .bind(request.max_auto_retries)
        .bind(now.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(KnownError {
            id,
            name: request.name,
            pattern: request.pattern,
            severity: request.severity,
            category: request.category,
            corrective_action: request.corrective_action,
            root_cause: request.root_cause,
            resolution_report: request.resolution_report,
            auto_retry: request.auto_retry,
            max_auto_retries: request.max_auto_retries,
            active: true,
            created_at: now,
        })
    }
}
