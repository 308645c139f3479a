//! Job table queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{get_json, get_uuid, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{Job, JobCreate};
use crate::repositories::traits::JobRepo;
use crate::utils::datetime::parse_datetime;

const JOB_COLUMNS: &str = "id, name, job_type, config, schedule_cron, created_at, updated_at";

fn map_job(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<Job> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Job {
        id: get_uuid(row, "id")?,
        name: row.get("name"),
        job_type: row.get("job_type"),
        config: get_json(row, "config")?,
        schedule_cron: row.get("schedule_cron"),
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

#[async_trait]
impl JobRepo for SqliteStore {
    async fn create(&self, request: JobCreate, now: DateTime<Utc>) -> RepositoryResult<Job> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, name, job_type, config, schedule_cron, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&request.name)
        .bind(&request.job_type)
        .bind(serde_json::to_string(&request.config)?)
        .bind(&request.schedule_cron)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(Job {
            id,
            name: request.name,
            job_type: request.job_type,
            config: request.config,
            schedule_cron: request.schedule_cron,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_job).transpose()
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?"))
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(map_job).transpose()
    }

    async fn list_all(&self) -> RepositoryResult<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name"))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(map_job).collect()
    }
}
