//! Repository trait definitions
//!
//! The engine reads and writes the durable tables through these narrow
//! interfaces so the pipeline and incident code can run against in-memory
//! fakes in tests and against the SQL store in production. Methods are
//! operation-shaped rather than generic CRUD: each one corresponds to a
//! mutation the engine actually performs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::RepositoryResult;
use crate::models::{
    DepartmentRecord, DepartmentSource, Incident, Job, JobCreate, JobRun, KnownError,
    KnownErrorCreate, ReportArtifacts, RunFinalize, StepRecord, Upload, UploadCreate, UploadStatus,
};

#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create(&self, request: UploadCreate, received_at: DateTime<Utc>)
        -> RepositoryResult<Upload>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Upload>>;

    async fn set_file_path(&self, id: Uuid, path: &str) -> RepositoryResult<()>;

    /// Transition the upload's status
    ///
    /// Implementations clear the report artifacts whenever the new status
    /// is anything other than `published`; artifacts and status move
    /// together or not at all.
    async fn set_status(&self, id: Uuid, status: UploadStatus) -> RepositoryResult<()>;

    /// Store the published artifacts and set status to `published` in one
    /// write
    async fn store_report(&self, id: Uuid, artifacts: ReportArtifacts) -> RepositoryResult<()>;
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn create(&self, request: JobCreate, now: DateTime<Utc>) -> RepositoryResult<Job>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Job>>;

    async fn find_by_name(&self, name: &str) -> RepositoryResult<Option<Job>>;

    async fn list_all(&self) -> RepositoryResult<Vec<Job>>;
}

#[async_trait]
pub trait JobRunRepo: Send + Sync {
    /// Create a run in `running` state; workers call this on claim
    async fn create_running(
        &self,
        job_id: Uuid,
        upload_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<JobRun>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<JobRun>>;

    /// Attach the upload a run turned out to operate on
    async fn set_upload(&self, run_id: Uuid, upload_id: Uuid) -> RepositoryResult<()>;

    /// Overwrite the run's step telemetry; callers only ever append to or
    /// update the tail of the sequence
    async fn update_details(&self, run_id: Uuid, details: Vec<StepRecord>) -> RepositoryResult<()>;

    async fn finalize(&self, finalize: RunFinalize) -> RepositoryResult<()>;

    /// Most recent run of `job_id` for `upload_id`, by started_at
    async fn latest_for_upload(
        &self,
        upload_id: Uuid,
        job_id: Uuid,
    ) -> RepositoryResult<Option<JobRun>>;

    /// Most recent run of a job regardless of upload, by started_at
    async fn latest_for_job(&self, job_id: Uuid) -> RepositoryResult<Option<JobRun>>;

    /// Delete runs finished before the cutoff; returns the count removed
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64>;
}

#[async_trait]
pub trait IncidentRepo: Send + Sync {
    async fn insert(&self, incident: Incident) -> RepositoryResult<Incident>;

    /// Overwrite a full incident row; the writer owns field-level rules
    async fn update(&self, incident: Incident) -> RepositoryResult<Incident>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<Incident>>;

    /// The single open or in-progress incident for (upload, stage), if any
    async fn find_open_for_stage(
        &self,
        upload_id: Uuid,
        stage: &str,
    ) -> RepositoryResult<Option<Incident>>;

    /// All open or in-progress incidents for an upload
    async fn list_open_for_upload(&self, upload_id: Uuid) -> RepositoryResult<Vec<Incident>>;

    /// Delete incidents created before the cutoff; returns the count removed
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64>;
}

#[async_trait]
pub trait KnownErrorRepo: Send + Sync {
    /// Active rules ordered by (created_at, id): earliest wins a match tie
    async fn list_active(&self) -> RepositoryResult<Vec<KnownError>>;

    async fn find_by_id(&self, id: Uuid) -> RepositoryResult<Option<KnownError>>;

    /// Seed a rule keyed on its pattern; an existing pattern is returned
    /// untouched so operator edits survive restarts
    async fn get_or_create(
        &self,
        request: KnownErrorCreate,
        now: DateTime<Utc>,
    ) -> RepositoryResult<KnownError>;
}

#[async_trait]
pub trait DepartmentRepo: Send + Sync {
    /// Resolve a department string against source code first, then name,
    /// both case-insensitively
    async fn find_source(&self, department: &str) -> RepositoryResult<Option<DepartmentSource>>;

    async fn list_active_sources(&self) -> RepositoryResult<Vec<DepartmentSource>>;

    /// Newest-first records for a source, bounded by `limit`
    async fn records_for_source(
        &self,
        source_id: Uuid,
        limit: usize,
    ) -> RepositoryResult<Vec<DepartmentRecord>>;

    async fn set_last_ingested(
        &self,
        source_id: Uuid,
        at: DateTime<Utc>,
    ) -> RepositoryResult<()>;
}

/// How a pipeline failure lands on the incident table
#[derive(Debug, Clone)]
pub enum IncidentWrite {
    /// First failure for this (upload, stage): insert a fresh incident
    Create(Incident),
    /// Recurrence: overwrite the existing open incident
    Update(Incident),
}

/// Atomic (run finalise + incident write) sink
///
/// The run reaching `failed` and the incident recording that failure must
/// land together: one transaction in the SQL store, one lock in the
/// in-memory store.
#[async_trait]
pub trait FailureSink: Send + Sync {
    async fn record_failure(
        &self,
        finalize: RunFinalize,
        incident: IncidentWrite,
    ) -> RepositoryResult<Incident>;
}

/// The full set of repository handles the engine is wired with
#[derive(Clone)]
pub struct Repos {
    pub uploads: std::sync::Arc<dyn UploadRepo>,
    pub jobs: std::sync::Arc<dyn JobRepo>,
    pub runs: std::sync::Arc<dyn JobRunRepo>,
    pub incidents: std::sync::Arc<dyn IncidentRepo>,
    pub known_errors: std::sync::Arc<dyn KnownErrorRepo>,
    pub departments: std::sync::Arc<dyn DepartmentRepo>,
    pub failures: std::sync::Arc<dyn FailureSink>,
}
