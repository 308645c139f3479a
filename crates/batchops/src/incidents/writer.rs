//! Incident writer
//!
//! Creates and mutates incident records. One open incident is permitted
//! per (upload, failing stage): the first failure creates it, later
//! failures append a recurrence. All state changes land on the timeline,
//! which is append-only.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::matcher::KnownErrorMatcher;
use crate::errors::{EngineError, EngineResult, RepositoryError, StageError};
use crate::job_scheduling::JobQueue;
use crate::metrics::EngineMetrics;
use crate::models::{
    DetectionSource, Incident, IncidentState, KnownError, RunFinalize, Severity, TimelineEvent,
    Upload, UploadStatus,
};
use crate::pipeline::PIPELINE_JOB_NAME;
use crate::repositories::{FailureSink, IncidentRepo, IncidentWrite, JobRepo, Repos, UploadRepo};
use crate::utils::clock::Clock;

/// Actor recorded on engine-driven timeline events
const ENGINE_ACTOR: &str = "engine";

/// Linear auto-retry backoff: attempt x 30s, clamped to [30s, 10min]
fn retry_backoff(attempt: i32) -> Duration {
    let seconds = (attempt as i64) * 30;
    Duration::seconds(seconds.clamp(30, 600))
}

pub struct IncidentWriter {
    repos: Repos,
    queue: Arc<JobQueue>,
    matcher: KnownErrorMatcher,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
}

impl IncidentWriter {
    pub fn new(
        repos: Repos,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let matcher = KnownErrorMatcher::new(repos.known_errors.clone());
        Self {
            repos,
            queue,
            matcher,
            clock,
            metrics,
        }
    }

    fn event(&self, actor: &str, event: &str, notes: Option<String>) -> TimelineEvent {
        TimelineEvent {
            timestamp: self.clock.now(),
            actor: actor.to_string(),
            event: event.to_string(),
            notes,
        }
    }

    /// Record a pipeline stage failure
    ///
    /// Finalises the failed run and writes the incident atomically, then
    /// schedules a bounded auto-retry when the matched known error calls
    /// for one. Returns the stored incident.
    pub async fn record_pipeline_failure(
        &self,
        upload: &Upload,
        stage: &str,
        error: &StageError,
        finalize: RunFinalize,
    ) -> EngineResult<Incident> {
        let message = error.to_string();
        let matched = self.matcher.match_message(&message).await?;
        let existing = self
            .repos
            .incidents
            .find_open_for_stage(upload.id, stage)
            .await?;
        let now = self.clock.now();
        let run_id = finalize.run_id;

        let (mut incident, is_new) = match existing {
            Some(mut incident) => {
                incident.error = message.clone();
                incident.job_run_id = Some(run_id);
                incident
                    .timeline
                    .push(self.event(ENGINE_ACTOR, "recurrence", Some(message.clone())));
                (incident, false)
            }
            None => {
                let incident = self.build_incident(upload, stage, run_id, &message, matched.as_ref(), error, now);
                (incident, true)
            }
        };

        // Auto-retry accounting happens before the atomic write so the
        // incremented counter is durable before anything is enqueued.
        let retry_at = self.plan_auto_retry(&mut incident, matched.as_ref());

        let write = if is_new {
            IncidentWrite::Create(incident)
        } else {
            IncidentWrite::Update(incident)
        };
        let stored = self.repos.failures.record_failure(finalize, write).await?;
        self.metrics
            .record_incident(if is_new { "open" } else { "recurrence" });

        if let Some(at) = retry_at {
            self.enqueue_pipeline(upload.id, at).await?;
            info!(
                "Auto-retry #{} scheduled for upload {} at {}",
                stored.auto_retry_count, upload.id, at
            );
        }

        Ok(stored)
    }

    fn build_incident(
        &self,
        upload: &Upload,
        stage: &str,
        run_id: Uuid,
        message: &str,
        matched: Option<&KnownError>,
        error: &StageError,
        now: DateTime<Utc>,
    ) -> Incident {
        let mut timeline = vec![self.event(
            ENGINE_ACTOR,
            "incident_detected",
            Some(truncate(message, 280)),
        )];
        if let Some(rule) = matched {
            timeline.push(self.event(
                ENGINE_ACTOR,
                "known_error_tagged",
                Some(format!("Matched '{}'", rule.name)),
            ));
        }

        Incident {
            id: Uuid::new_v4(),
            upload_id: upload.id,
            job_run_id: Some(run_id),
            stage: stage.to_string(),
            state: IncidentState::Open,
            severity: matched.map(|r| r.severity).unwrap_or(error.default_severity()),
            category: Some(
                matched
                    .map(|r| r.category.clone())
                    .unwrap_or_else(|| error.category().to_string()),
            ),
            error: message.to_string(),
            root_cause: matched.and_then(|r| r.root_cause.clone()),
            corrective_action: matched.and_then(|r| r.corrective_action.clone()),
            impact_summary: None,
            analysis_notes: None,
            resolution_report: matched.and_then(|r| r.resolution_report.clone()),
            matched_known_error: matched.map(|r| r.id),
            is_known: matched.is_some(),
            auto_retry_count: 0,
            max_auto_retries: matched.map(|r| r.max_auto_retries).unwrap_or(0),
            detection_source: DetectionSource::Engine,
            assignee: None,
            resolved_by: None,
            timeline,
            created_at: now,
            resolved_at: None,
            archived_at: None,
        }
    }

    /// Decide whether this failure earns an auto-retry; mutates counters
    /// and timeline, returns the fire time if one was scheduled
    fn plan_auto_retry(
        &self,
        incident: &mut Incident,
        matched: Option<&KnownError>,
    ) -> Option<DateTime<Utc>> {
        let rule = matched?;
        if !rule.auto_retry {
            return None;
        }
        if incident.auto_retry_count >= incident.max_auto_retries {
            incident.timeline.push(self.event(
                ENGINE_ACTOR,
                "auto_retry_limit_reached",
                Some(format!(
                    "Max retries ({}) exhausted",
                    incident.max_auto_retries
                )),
            ));
            return None;
        }

        incident.auto_retry_count += 1;
        incident.state = IncidentState::InProgress;
        let delay = retry_backoff(incident.auto_retry_count);
        let at = self.clock.now() + delay;
        incident.timeline.push(self.event(
            ENGINE_ACTOR,
            "auto_retry_scheduled",
            Some(format!(
                "Retry #{} queued in {}s",
                incident.auto_retry_count,
                delay.num_seconds()
            )),
        ));
        Some(at)
    }

    /// Auto-resolve any remaining open incident after a successful publish
    ///
    /// The full failure record stays for audit; only the workflow state
    /// moves to resolved.
    pub async fn handle_pipeline_success(&self, upload_id: Uuid) -> EngineResult<usize> {
        let open = self.repos.incidents.list_open_for_upload(upload_id).await?;
        let count = open.len();
        let now = self.clock.now();

        for mut incident in open {
            incident.state = IncidentState::Resolved;
            incident.resolved_at = Some(now);
            incident.resolved_by = Some(ENGINE_ACTOR.to_string());
            if incident.resolution_report.is_none() {
                incident.resolution_report =
                    Some("Auto-resolved after a successful pipeline run".to_string());
            }
            incident
                .timeline
                .push(self.event(ENGINE_ACTOR, "auto_resolved", None));
            self.repos.incidents.update(incident).await?;
            self.metrics.record_incident("resolved");
        }

        Ok(count)
    }

    async fn load(&self, incident_id: Uuid) -> EngineResult<Incident> {
        self.repos
            .incidents
            .find_by_id(incident_id)
            .await?
            .ok_or_else(|| {
                RepositoryError::NotFound {
                    resource: "incident".to_string(),
                    id: incident_id.to_string(),
                }
                .into()
            })
    }

    /// Assign an incident; the first assignment moves open -> in_progress
    pub async fn assign(
        &self,
        incident_id: Uuid,
        assignee: &str,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<Incident> {
        let mut incident = self.load(incident_id).await?;
        incident.assignee = Some(assignee.to_string());
        if incident.state == IncidentState::Open {
            incident.state = IncidentState::InProgress;
        }
        incident.timeline.push(self.event(
            actor,
            "assigned",
            notes.or_else(|| Some(format!("Assigned to {assignee}"))),
        ));
        Ok(self.repos.incidents.update(incident).await?)
    }

    /// Update triage fields
    pub async fn analyze(
        &self,
        incident_id: Uuid,
        severity: Option<Severity>,
        impact_summary: Option<String>,
        analysis_notes: Option<String>,
        actor: &str,
    ) -> EngineResult<Incident> {
        let mut incident = self.load(incident_id).await?;
        if let Some(severity) = severity {
            incident.severity = severity;
        }
        if impact_summary.is_some() {
            incident.impact_summary = impact_summary;
        }
        if analysis_notes.is_some() {
            incident.analysis_notes = analysis_notes.clone();
        }
        incident.timeline.push(self.event(
            actor,
            "analysis_updated",
            analysis_notes.or(Some("Analysis details updated".to_string())),
        ));
        Ok(self.repos.incidents.update(incident).await?)
    }

    /// Resolve an incident; fails on archived, idempotent on resolved
    pub async fn resolve(
        &self,
        incident_id: Uuid,
        root_cause: Option<String>,
        corrective_action: Option<String>,
        resolution_report: Option<String>,
        resolved_by: &str,
    ) -> EngineResult<Incident> {
        let mut incident = self.load(incident_id).await?;
        if incident.state == IncidentState::Archived {
            return Err(RepositoryError::InvalidTransition {
                resource: "incident".to_string(),
                id: incident_id.to_string(),
                message: "cannot resolve an archived incident".to_string(),
            }
            .into());
        }

        if root_cause.is_some() {
            incident.root_cause = root_cause;
        }
        if corrective_action.is_some() {
            incident.corrective_action = corrective_action;
        }
        if resolution_report.is_some() {
            incident.resolution_report = resolution_report;
        }
        if incident.state != IncidentState::Resolved {
            incident.state = IncidentState::Resolved;
            incident.resolved_at = Some(self.clock.now());
            self.metrics.record_incident("resolved");
        }
        incident.resolved_by = Some(resolved_by.to_string());
        incident.timeline.push(self.event(
            resolved_by,
            "resolved",
            incident.resolution_report.clone(),
        ));
        Ok(self.repos.incidents.update(incident).await?)
    }

    /// Re-enqueue the pipeline for the incident's upload
    ///
    /// Permitted in any non-archived state. A failed upload moves back to
    /// pending so the status lifecycle can restart.
    pub async fn retry(
        &self,
        incident_id: Uuid,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<Incident> {
        let mut incident = self.load(incident_id).await?;
        if incident.state == IncidentState::Archived {
            return Err(RepositoryError::InvalidTransition {
                resource: "incident".to_string(),
                id: incident_id.to_string(),
                message: "cannot retry an archived incident".to_string(),
            }
            .into());
        }

        if let Some(upload) = self.repos.uploads.find_by_id(incident.upload_id).await? {
            if upload.status == UploadStatus::Failed {
                self.repos
                    .uploads
                    .set_status(upload.id, UploadStatus::Pending)
                    .await?;
            }
        }

        self.enqueue_pipeline(incident.upload_id, self.clock.now()).await?;

        incident.state = IncidentState::InProgress;
        incident.resolved_at = None;
        incident.timeline.push(self.event(actor, "manual_retry", notes));
        Ok(self.repos.incidents.update(incident).await?)
    }

    /// Archive a resolved incident; terminal and idempotent
    pub async fn archive(
        &self,
        incident_id: Uuid,
        actor: &str,
        notes: Option<String>,
    ) -> EngineResult<Incident> {
        let mut incident = self.load(incident_id).await?;
        if incident.state == IncidentState::Archived {
            return Ok(incident);
        }
        if incident.state != IncidentState::Resolved {
            return Err(RepositoryError::InvalidTransition {
                resource: "incident".to_string(),
                id: incident_id.to_string(),
                message: format!(
                    "can only archive resolved incidents, state is {}",
                    incident.state.as_str()
                ),
            }
            .into());
        }
        incident.state = IncidentState::Archived;
        incident.archived_at = Some(self.clock.now());
        incident.timeline.push(self.event(actor, "archived", notes));
        self.metrics.record_incident("archived");
        Ok(self.repos.incidents.update(incident).await?)
    }

    /// Enqueue a pipeline execution for an upload at `at`
    async fn enqueue_pipeline(&self, upload_id: Uuid, at: DateTime<Utc>) -> EngineResult<()> {
        let Some(job) = self.repos.jobs.find_by_name(PIPELINE_JOB_NAME).await? else {
            return Err(EngineError::internal(format!(
                "pipeline job '{PIPELINE_JOB_NAME}' is not registered"
            )));
        };
        let args = vec![serde_json::Value::String(upload_id.to_string())];
        let now = self.clock.now();
        if at <= now {
            self.queue.enqueue(job.id, args, serde_json::Map::new(), now).await?;
        } else {
            self.queue
                .enqueue_at(job.id, args, serde_json::Map::new(), at)
                .await?;
        }
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_with_floor_and_ceiling() {
        assert_eq!(retry_backoff(1), Duration::seconds(30));
        assert_eq!(retry_backoff(2), Duration::seconds(60));
        assert_eq!(retry_backoff(10), Duration::seconds(300));
        assert_eq!(retry_backoff(50), Duration::seconds(600));
        assert_eq!(retry_backoff(0), Duration::seconds(30));
    }
}
