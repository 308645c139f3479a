//! Department source and record queries (read-mostly)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{get_uuid, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{DepartmentRecord, DepartmentSource};
use crate::repositories::traits::DepartmentRepo;
use crate::utils::datetime::{parse_datetime, parse_datetime_opt};

const SOURCE_COLUMNS: &str = "id, name, code, description, active, last_ingested_at, created_at";
const RECORD_COLUMNS: &str = "id, source_id, student_id, student_name, class_name, score, \
     attendance_percent, status, recorded_at";

fn map_source(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<DepartmentSource> {
    let created_at: String = row.get("created_at");
    Ok(DepartmentSource {
        id: get_uuid(row, "id")?,
        name: row.get("name"),
        code: row.get("code"),
        description: row.get("description"),
        active: row.get("active"),
        last_ingested_at: parse_datetime_opt(row.get("last_ingested_at"))?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn map_record(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<DepartmentRecord> {
    let recorded_at: String = row.get("recorded_at");
    Ok(DepartmentRecord {
        id: get_uuid(row, "id")?,
        source_id: get_uuid(row, "source_id")?,
        student_id: row.get("student_id"),
        student_name: row.get("student_name"),
        class_name: row.get("class_name"),
        score: row.get("score"),
        attendance_percent: row.get("attendance_percent"),
        status: row.get("status"),
        recorded_at: parse_datetime(&recorded_at)?,
    })
}

#[async_trait]
impl DepartmentRepo for SqliteStore {
    async fn find_source(&self, department: &str) -> RepositoryResult<Option<DepartmentSource>> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM department_sources \
             WHERE code = ? COLLATE NOCASE OR name = ? COLLATE NOCASE \
             ORDER BY CASE WHEN code = ? COLLATE NOCASE THEN 0 ELSE 1 END LIMIT 1"
        ))
        .bind(department)
        .bind(department)
        .bind(department)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_source).transpose()
    }

    async fn list_active_sources(&self) -> RepositoryResult<Vec<DepartmentSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM department_sources WHERE active = 1 ORDER BY name"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_source).collect()
    }

    async fn records_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> RepositoryResult<Vec<DepartmentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM department_records WHERE source_id = ? \
             ORDER BY recorded_at DESC LIMIT ?"
        ))
        .bind(source_id.to_string())
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_record).collect()
    }

    async fn set_last_ingested(&self, source_id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()> {
        sqlx::query("UPDATE department_sources SET last_ingested_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(source_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
