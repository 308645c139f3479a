//! Incident table queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{get_json, get_uuid, get_uuid_opt, SqliteStore};
use crate::errors::RepositoryResult;
use crate::models::{DetectionSource, Incident, IncidentState, Severity};
use crate::repositories::traits::IncidentRepo;
use crate::utils::datetime::{parse_datetime, parse_datetime_opt};

const INCIDENT_COLUMNS: &str = "id, upload_id, job_run_id, stage, state, severity, category, \
     error, root_cause, corrective_action, impact_summary, analysis_notes, resolution_report, \
     matched_known_error, is_known, auto_retry_count, max_auto_retries, detection_source, \
     assignee, resolved_by, timeline, created_at, resolved_at, archived_at";

fn map_incident(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<Incident> {
    let state_raw: String = row.get("state");
    let severity_raw: String = row.get("severity");
    let source_raw: String = row.get("detection_source");
    let created_at: String = row.get("created_at");
    Ok(Incident {
        id: get_uuid(row, "id")?,
        upload_id: get_uuid(row, "upload_id")?,
        job_run_id: get_uuid_opt(row, "job_run_id")?,
        stage: row.get("stage"),
        state: IncidentState::parse(&state_raw).unwrap_or(IncidentState::Open),
        severity: Severity::parse(&severity_raw).unwrap_or(Severity::Medium),
        category: row.get("category"),
        error: row.get("error"),
        root_cause: row.get("root_cause"),
        corrective_action: row.get("corrective_action"),
        impact_summary: row.get("impact_summary"),
        analysis_notes: row.get("analysis_notes"),
        resolution_report: row.get("resolution_report"),
        matched_known_error: get_uuid_opt(row, "matched_known_error")?,
        is_known: row.get("is_known"),
        auto_retry_count: row.get("auto_retry_count"),
        max_auto_retries: row.get("max_auto_retries"),
        detection_source: DetectionSource::parse(&source_raw).unwrap_or(DetectionSource::Engine),
        assignee: row.get("assignee"),
        resolved_by: row.get("resolved_by"),
        timeline: get_json(row, "timeline")?,
        created_at: parse_datetime(&created_at)?,
        resolved_at: parse_datetime_opt(row.get("resolved_at"))?,
        archived_at: parse_datetime_opt(row.get("archived_at"))?,
    })
}

pub(crate) async fn exec_insert_incident(
    conn: &mut SqliteConnection,
    incident: &Incident,
) -> RepositoryResult<()> {
    sqlx::query(
        "INSERT INTO incidents (id, upload_id, job_run_id, stage, state, severity, category, \
         error, root_cause, corrective_action, impact_summary, analysis_notes, \
         resolution_report, matched_known_error, is_known, auto_retry_count, max_auto_retries, \
         detection_source, assignee, resolved_by, timeline, created_at, resolved_at, archived_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(incident.id.to_string())
    .bind(incident.upload_id.to_string())
    .bind(incident.job_run_id.map(|u| u.to_string()))
    .bind(&incident.stage)
    .bind(incident.state.as_str())
    .bind(incident.severity.as_str())
    .bind(&incident.category)
    .bind(&incident.error)
    .bind(&incident.root_cause)
    .bind(&incident.corrective_action)
    .bind(&incident.impact_summary)
    .bind(&incident.analysis_notes)
    .bind(&incident.resolution_report)
    .bind(incident.matched_known_error.map(|u| u.to_string()))
    .bind(incident.is_known)
    .bind(incident.auto_retry_count)
    .bind(incident.max_auto_retries)
    .bind(incident.detection_source.as_str())
    .bind(&incident.assignee)
    .bind(&incident.resolved_by)
    .bind(serde_json::to_string(&incident.timeline)?)
    .bind(incident.created_at.to_rfc3339())
    .bind(incident.resolved_at.map(|t| t.to_rfc3339()))
    .bind(incident.archived_at.map(|t| t.to_rfc3339()))
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn exec_update_incident(
    conn: &mut SqliteConnection,
    incident: &Incident,
) -> RepositoryResult<()> {
    sqlx::query(
        "UPDATE incidents SET state = ?, severity = ?, category = ?, error = ?, root_cause = ?, \
         corrective_action = ?, impact_summary = ?, analysis_notes = ?, resolution_report = ?, \
         matched_known_error = ?, is_known = ?, auto_retry_count = ?, max_auto_retries = ?, \
         assignee = ?, resolved_by = ?, timeline = ?, resolved_at = ?, archived_at = ?, \
         job_run_id = ? WHERE id = ?",
    )
    .bind(incident.state.as_str())
    .bind(incident.severity.as_str())
    .bind(&incident.category)
    .bind(&incident.error)
    .bind(&incident.root_cause)
    .bind(&incident.corrective_action)
    .bind(&incident.impact_summary)
    .bind(&incident.analysis_notes)
    .bind(&incident.resolution_report)
    .bind(incident.matched_known_error.map(|u| u.to_string()))
    .bind(incident.is_known)
    .bind(incident.auto_retry_count)
    .bind(incident.max_auto_retries)
    .bind(&incident.assignee)
    .bind(&incident.resolved_by)
    .bind(serde_json::to_string(&incident.timeline)?)
    .bind(incident.resolved_at.map(|t| t.to_rfc3339()))
    .bind(incident.archived_at.map(|t| t.to_rfc3339()))
    .bind(incident.job_run_id.map(|u| u.to_string()))
    .bind(incident.id.to_string())
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl IncidentRepo for SqliteStore {
    async fn insert(&self, incident: Incident) -> RepositoryResult<Incident> {
        let mut conn = self.pool().acquire().await?;
        exec_insert_incident(&mut *conn, &incident).await?;
        Ok(incident)
    }

    async fn update(&self, incident: Incident) -> RepositoryResult<Incident> {
        let mut conn = self.pool().acquire().await?;
        exec_update_incident(&mut *conn, &incident).await?;
        Ok(incident)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Incident>> {
        let row = sqlx::query(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_incident).transpose()
    }

    async fn find_open_for_stage(
        &self,
        upload_id: Uuid,
        stage: &str,
    ) -> RepositoryResult<Option<Incident>> {
        let row = sqlx::query(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE upload_id = ? AND stage = ? \
             AND state IN ('open', 'in_progress') ORDER BY created_at LIMIT 1"
        ))
        .bind(upload_id.to_string())
        .bind(stage)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_incident).transpose()
    }

    async fn list_open_for_upload(&self, upload_id: Uuid) -> RepositoryResult<Vec<Incident>> {
        let rows = sqlx::query(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE upload_id = ? \
             AND state IN ('open', 'in_progress') ORDER BY created_at"
        ))
        .bind(upload_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_incident).collect()
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query("DELETE FROM incidents WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
