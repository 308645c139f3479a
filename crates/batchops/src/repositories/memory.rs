//! In-memory repositories
//!
//! One shared state behind a single lock implements every repository
//! trait. Tests and single-node trials run entirely against this store;
//! the single lock also makes the atomic (run finalise + incident write)
//! requirement trivial to honor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::traits::{
    DepartmentRepo, FailureSink, IncidentRepo, IncidentWrite, JobRepo, JobRunRepo, KnownErrorRepo,
    Repos, UploadRepo,
};
use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::{
    DepartmentRecord, DepartmentSource, Incident, IncidentState, Job, JobCreate, JobRun,
    JobRunStatus, KnownError, KnownErrorCreate, ReportArtifacts, RunFinalize, StepRecord, Upload,
    UploadCreate, UploadStatus,
};

#[derive(Default)]
struct State {
    uploads: HashMap<Uuid, Upload>,
    jobs: HashMap<Uuid, Job>,
    runs: HashMap<Uuid, JobRun>,
    incidents: HashMap<Uuid, Incident>,
    known_errors: HashMap<Uuid, KnownError>,
    sources: HashMap<Uuid, DepartmentSource>,
    records: Vec<DepartmentRecord>,
}

/// Shared in-memory store implementing all repository traits
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle this store as the engine's repository set
    pub fn repos(&self) -> Repos {
        Repos {
            uploads: Arc::new(self.clone()),
            jobs: Arc::new(self.clone()),
            runs: Arc::new(self.clone()),
            incidents: Arc::new(self.clone()),
            known_errors: Arc::new(self.clone()),
            departments: Arc::new(self.clone()),
            failures: Arc::new(self.clone()),
        }
    }

    /// Seed a department source (test/bootstrap helper)
    pub async fn insert_department_source(&self, source: DepartmentSource) {
        self.state
            .write()
            .await
            .sources
            .insert(source.id, source);
    }

    /// Seed a department record (test/bootstrap helper)
    pub async fn insert_department_record(&self, record: DepartmentRecord) {
        self.state.write().await.records.push(record);
    }
}

fn not_found(resource: &str, id: Uuid) -> RepositoryError {
    RepositoryError::NotFound {
        resource: resource.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl UploadRepo for MemoryStore {
    async fn create(
        &self,
        request: UploadCreate,
        received_at: DateTime<Utc>,
    ) -> RepositoryResult<Upload> {
        let upload = Upload {
            id: Uuid::new_v4(),
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
        };
        self.state
            .write()
            .await
            .uploads
            .insert(upload.id, upload.clone());
        Ok(upload)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Upload>> {
        Ok(self.state.read().await.uploads.get(&id).cloned())
    }

    async fn set_file_path(&self, id: Uuid, path: &str) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let upload = state.uploads.get_mut(&id).ok_or(not_found("upload", id))?;
        upload.file_path = Some(path.to_string());
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: UploadStatus) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let upload = state.uploads.get_mut(&id).ok_or(not_found("upload", id))?;
        upload.status = status;
        if status != UploadStatus::Published {
            upload.report_csv = None;
            upload.report_pdf = None;
            upload.report_meta = None;
            upload.report_generated_at = None;
        }
        Ok(())
    }

    async fn store_report(&self, id: Uuid, artifacts: ReportArtifacts) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let upload = state.uploads.get_mut(&id).ok_or(not_found("upload", id))?;
        upload.status = UploadStatus::Published;
        upload.report_csv = Some(artifacts.csv);
        upload.report_pdf = Some(artifacts.pdf);
        upload.report_meta = Some(artifacts.meta);
        upload.report_generated_at = Some(artifacts.generated_at);
        Ok(())
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn create(&self, request: JobCreate, now: DateTime<Utc>) -> RepositoryResult<Job> {
        let mut state = self.state.write().await;
        if state.jobs.values().any(|j| j.name == request.name) {
            return Err(RepositoryError::ConstraintViolation {
                constraint: "jobs.name unique".to_string(),
                message: format!("job '{}' already exists", request.name),
            });
        }
        let job = Job {
            id: Uuid::new_v4(),
            name: request.name,
            job_type: request.job_type,
            config: request.config,
            schedule_cron: request.schedule_cron,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Job>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .values()
            .find(|j| j.name == name)
            .cloned())
    }

    async fn list_all(&self) -> RepositoryResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }
}

#[async_trait]
impl JobRunRepo for MemoryStore {
    async fn create_running(
        &self,
        job_id: Uuid,
        upload_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<JobRun> {
        let run = JobRun {
            id: Uuid::new_v4(),
            job_id,
            upload_id,
            status: JobRunStatus::Running,
            started_at: Some(started_at),
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            details: Vec::new(),
            logs: String::new(),
        };
        self.state.write().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<JobRun>> {
        Ok(self.state.read().await.runs.get(&id).cloned())
    }

    async fn set_upload(&self, run_id: Uuid, upload_id: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(&run_id).ok_or(not_found("job_run", run_id))?;
        run.upload_id = Some(upload_id);
        Ok(())
    }

    async fn update_details(&self, run_id: Uuid, details: Vec<StepRecord>) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(&run_id).ok_or(not_found("job_run", run_id))?;
        run.details = details;
        Ok(())
    }

    async fn finalize(&self, finalize: RunFinalize) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        apply_finalize(&mut state, &finalize)
    }

    async fn latest_for_upload(
        &self,
        upload_id: Uuid,
        job_id: Uuid,
    ) -> RepositoryResult<Option<JobRun>> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.upload_id == Some(upload_id) && r.job_id == job_id)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn latest_for_job(&self, job_id: Uuid) -> RepositoryResult<Option<JobRun>> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.job_id == job_id)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let mut state = self.state.write().await;
        let before = state.runs.len();
        state
            .runs
            .retain(|_, r| !matches!(r.finished_at, Some(t) if t < cutoff));
        Ok((before - state.runs.len()) as u64)
    }
}

fn apply_finalize(state: &mut State, finalize: &RunFinalize) -> RepositoryResult<()> {
    let run = state
        .runs
        .get_mut(&finalize.run_id)
        .ok_or(not_found("job_run", finalize.run_id))?;
    run.status = finalize.status;
    run.finished_at = Some(finalize.finished_at);
    run.duration_ms = Some(finalize.duration_ms);
    run.exit_code = Some(finalize.exit_code);
    run.details = finalize.details.clone();
    run.logs = finalize.logs.clone();
    Ok(())
}

#[async_trait]
impl IncidentRepo for MemoryStore {
    async fn insert(&self, incident: Incident) -> RepositoryResult<Incident> {
        self.state
            .write()
            .await
            .incidents
            .insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn update(&self, incident: Incident) -> RepositoryResult<Incident> {
        let mut state = self.state.write().await;
        if !state.incidents.contains_key(&incident.id) {
            return Err(not_found("incident", incident.id));
        }
        state.incidents.insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Incident>> {
        Ok(self.state.read().await.incidents.get(&id).cloned())
    }

    async fn find_open_for_stage(
        &self,
        upload_id: Uuid,
        stage: &str,
    ) -> RepositoryResult<Option<Incident>> {
        Ok(self
            .state
            .read()
            .await
            .incidents
            .values()
            .find(|i| {
                i.upload_id == upload_id
                    && i.stage == stage
                    && matches!(i.state, IncidentState::Open | IncidentState::InProgress)
            })
            .cloned())
    }

    async fn list_open_for_upload(&self, upload_id: Uuid) -> RepositoryResult<Vec<Incident>> {
        let mut open: Vec<Incident> = self
            .state
            .read()
            .await
            .incidents
            .values()
            .filter(|i| {
                i.upload_id == upload_id
                    && matches!(i.state, IncidentState::Open | IncidentState::InProgress)
            })
            .cloned()
            .collect();
        open.sort_by_key(|i| i.created_at);
        Ok(open)
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let mut state = self.state.write().await;
        let before = state.incidents.len();
        state.incidents.retain(|_, i| i.created_at >= cutoff);
        Ok((before - state.incidents.len()) as u64)
    }
}

#[async_trait]
impl KnownErrorRepo for MemoryStore {
    async fn list_active(&self) -> RepositoryResult<Vec<KnownError>> {
        let mut rules: Vec<KnownError> = self
            .state
            .read()
            .await
            .known_errors
            .values()
            .filter(|k| k.active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rules)
    }

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<KnownError>> {
        Ok(self.state.read().await.known_errors.get(&id).cloned())
    }

    async fn get_or_create(
        &self,
        request: KnownErrorCreate,
        now: DateTime<Utc>,
    ) -> RepositoryResult<KnownError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .known_errors
            .values()
            .find(|k| k.pattern == request.pattern)
        {
            return Ok(existing.clone());
        }
        let rule = KnownError {
            id: Uuid::new_v4(),
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
        };
        state.known_errors.insert(rule.id, rule.clone());
        Ok(rule)
    }
}

#[async_trait]
impl DepartmentRepo for MemoryStore {
    async fn find_source(&self, department: &str) -> RepositoryResult<Option<DepartmentSource>> {
        let state = self.state.read().await;
        let by_code = state
            .sources
            .values()
            .find(|s| s.code.eq_ignore_ascii_case(department));
        let found = by_code.or_else(|| {
            state
                .sources
                .values()
                .find(|s| s.name.eq_ignore_ascii_case(department))
        });
        Ok(found.cloned())
    }

    async fn list_active_sources(&self) -> RepositoryResult<Vec<DepartmentSource>> {
        let mut sources: Vec<DepartmentSource> = self
            .state
            .read()
            .await
            .sources
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn records_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> RepositoryResult<Vec<DepartmentRecord>> {
        let mut records: Vec<DepartmentRecord> = self
            .state
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn set_last_ingested(&self, source_id: Uuid, at: DateTime<Utc>) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or(not_found("department_source", source_id))?;
        source.last_ingested_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl FailureSink for MemoryStore {
    async fn record_failure(
        &self,
        finalize: RunFinalize,
        incident: IncidentWrite,
    ) -> RepositoryResult<Incident> {
        let mut state = self.state.write().await;
        apply_finalize(&mut state, &finalize)?;
        let stored = match incident {
            IncidentWrite::Create(incident) => {
                state.incidents.insert(incident.id, incident.clone());
                incident
            }
            IncidentWrite::Update(incident) => {
                if !state.incidents.contains_key(&incident.id) {
                    return Err(not_found("incident", incident.id));
                }
                state.incidents.insert(incident.id, incident.clone());
                incident
            }
        };
        Ok(stored)
    }
}
