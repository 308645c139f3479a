//! End-to-end pipeline scenarios against the in-memory stores

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batchops::config::Config;
use batchops::job_scheduling::JobContext;
use batchops::kv::MemoryKvStore;
use batchops::models::{
    JobRunStatus, ProcessMode, StepStatus, UploadCreate, UploadStatus,
};
use batchops::pipeline::PIPELINE_JOB_NAME;
use batchops::repositories::{IncidentRepo, JobRepo, JobRunRepo, MemoryStore, UploadRepo};
use batchops::utils::clock::ManualClock;
use batchops::Engine;

struct Harness {
    engine: Arc<Engine>,
    clock: ManualClock,
    _tempdir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let tempdir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.root = tempdir.path().to_path_buf();

    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap());
    let engine = Engine::new(
        config,
        store.repos(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();

    Harness {
        engine,
        clock,
        _tempdir: tempdir,
    }
}

impl Harness {
    /// Create an upload whose stored file holds the given bytes
    async fn upload_with_file(
        &self,
        filename: &str,
        bytes: &[u8],
        mode: ProcessMode,
        config: serde_json::Value,
    ) -> Uuid {
        let upload = self
            .engine
            .repos
            .uploads
            .create(
                UploadCreate {
                    department: "General".to_string(),
                    filename: filename.to_string(),
                    notes: None,
                    process_mode: mode,
                    process_config: config,
                },
                self.clock.now_utc(),
            )
            .await
            .unwrap();

        let dir = self._tempdir.path().join("uploads").join(upload.id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(filename);
        std::fs::write(&path, bytes).unwrap();
        self.engine
            .repos
            .uploads
            .set_file_path(upload.id, path.to_str().unwrap())
            .await
            .unwrap();
        upload.id
    }

    /// Open a run and execute the pipeline, the way a worker would
    async fn run_pipeline(&self, upload_id: Uuid) -> String {
        let job = self
            .engine
            .repos
            .jobs
            .find_by_name(PIPELINE_JOB_NAME)
            .await
            .unwrap()
            .unwrap();
        let run = self
            .engine
            .repos
            .runs
            .create_running(job.id, None, self.clock.now_utc())
            .await
            .unwrap();
        let ctx = JobContext {
            run_id: run.id,
            job_id: job.id,
            job_name: job.name.clone(),
            cancellation: CancellationToken::new(),
        };
        self.engine
            .executor
            .execute(upload_id, &ctx)
            .await
            .unwrap()
    }
}

trait ClockExt {
    fn now_utc(&self) -> chrono::DateTime<Utc>;
}

impl ClockExt for ManualClock {
    fn now_utc(&self) -> chrono::DateTime<Utc> {
        use batchops::utils::clock::Clock;
        self.now()
    }
}

const GRADES_CSV: &[u8] = b"student_id,score\nS1,80\nS2,90\nS3,70\n";

#[tokio::test]
async fn happy_path_transform_publishes_summary() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file("grades.csv", GRADES_CSV, ProcessMode::Transform, serde_json::json!({}))
        .await;

    h.run_pipeline(upload_id).await;

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Published);
    assert!(upload.report_generated_at.is_some());
    let csv = upload.report_csv.as_deref().unwrap();
    assert!(csv.contains("row_count,3"));
    assert!(csv.contains("score.mean,80"));
    assert!(upload.report_pdf.as_deref().unwrap().starts_with(b"%PDF"));

    // Exactly five successful steps on the finalised run.
    let job = h
        .engine
        .repos
        .jobs
        .find_by_name(PIPELINE_JOB_NAME)
        .await
        .unwrap()
        .unwrap();
    let run = h
        .engine
        .repos
        .runs
        .latest_for_upload(upload_id, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, JobRunStatus::Success);
    assert_eq!(run.details.len(), 5);
    assert!(run.details.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(
        run.details.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        vec!["standardize", "validate", "transform", "summarize", "publish"]
    );

    // Run invariants: finished_at >= started_at, duration consistent.
    let (started, finished) = (run.started_at.unwrap(), run.finished_at.unwrap());
    assert!(finished >= started);
    assert_eq!(
        run.duration_ms.unwrap(),
        (finished - started).num_milliseconds()
    );
    assert_eq!(run.exit_code, Some(0));
}

#[tokio::test]
async fn append_mode_publishes_dataset_with_new_row() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file(
            "grades.csv",
            GRADES_CSV,
            ProcessMode::Append,
            serde_json::json!({"records": [{"student_id": "S99", "score": 77}]}),
        )
        .await;

    h.run_pipeline(upload_id).await;

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Published);
    let csv = upload.report_csv.as_deref().unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "student_id,score");
    assert_eq!(lines.len(), 5); // header + 4 rows
    assert_eq!(lines[4], "S99,77");
}

#[tokio::test]
async fn delete_mode_drops_matching_rows() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file(
            "grades.csv",
            GRADES_CSV,
            ProcessMode::Delete,
            serde_json::json!({"column": "student_id", "value": "S2"}),
        )
        .await;

    h.run_pipeline(upload_id).await;

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    let csv = upload.report_csv.as_deref().unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3); // header + 2 rows
    assert!(!csv.contains("S2"));
}

#[tokio::test]
async fn invalid_delete_plan_opens_transform_incident() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file(
            "grades.csv",
            GRADES_CSV,
            ProcessMode::Delete,
            serde_json::json!({"column": "grade_band", "value": "A"}),
        )
        .await;

    h.run_pipeline(upload_id).await;

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(upload.report_csv.is_none());

    let incidents = h
        .engine
        .repos
        .incidents
        .list_open_for_upload(upload_id)
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.stage, "transform");
    assert_eq!(incident.category.as_deref(), Some("transform"));
    assert!(incident.error.contains("Unknown column 'grade_band'"));
    assert!(!incident.is_known);
}

#[tokio::test]
async fn executor_is_idempotent_for_published_uploads() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file("grades.csv", GRADES_CSV, ProcessMode::Transform, serde_json::json!({}))
        .await;

    h.run_pipeline(upload_id).await;
    let first = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();

    // Redelivery: a second execution must not change anything.
    let message = h.run_pipeline(upload_id).await;
    assert!(message.contains("nothing to do"));

    let second = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.report_csv, second.report_csv);
    assert_eq!(first.report_generated_at, second.report_generated_at);

    // The latest attached run is still the first one with its five steps.
    let job = h
        .engine
        .repos
        .jobs
        .find_by_name(PIPELINE_JOB_NAME)
        .await
        .unwrap()
        .unwrap();
    let run = h
        .engine
        .repos
        .runs
        .latest_for_upload(upload_id, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.details.len(), 5);
}

#[tokio::test]
async fn processing_upload_resumes_from_first_unfinished_stage() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file("grades.csv", GRADES_CSV, ProcessMode::Transform, serde_json::json!({}))
        .await;

    // A prior run that died after validate.
    let job = h
        .engine
        .repos
        .jobs
        .find_by_name(PIPELINE_JOB_NAME)
        .await
        .unwrap()
        .unwrap();
    let prior = h
        .engine
        .repos
        .runs
        .create_running(job.id, Some(upload_id), h.clock.now_utc())
        .await
        .unwrap();
    let now = h.clock.now_utc();
    h.engine
        .repos
        .runs
        .update_details(
            prior.id,
            vec![
                batchops::models::StepRecord {
                    name: "standardize".to_string(),
                    status: StepStatus::Success,
                    started_at: now,
                    finished_at: Some(now),
                    logs: String::new(),
                },
                batchops::models::StepRecord {
                    name: "validate".to_string(),
                    status: StepStatus::Success,
                    started_at: now,
                    finished_at: Some(now),
                    logs: String::new(),
                },
                batchops::models::StepRecord {
                    name: "transform".to_string(),
                    status: StepStatus::Running,
                    started_at: now,
                    finished_at: None,
                    logs: String::new(),
                },
            ],
        )
        .await
        .unwrap();
    h.engine
        .repos
        .uploads
        .set_status(upload_id, UploadStatus::Processing)
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::minutes(10));
    h.run_pipeline(upload_id).await;

    let run = h
        .engine
        .repos
        .runs
        .latest_for_upload(upload_id, job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, JobRunStatus::Success);
    let statuses: Vec<StepStatus> = run.details.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Success,
            StepStatus::Success,
            StepStatus::Success,
        ]
    );

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Published);
}

#[tokio::test]
async fn unsupported_extension_fails_standardize_with_known_error() {
    let h = harness().await;
    let upload_id = h
        .upload_with_file(
            "grades.docx",
            b"not a table",
            ProcessMode::Transform,
            serde_json::json!({}),
        )
        .await;

    h.run_pipeline(upload_id).await;

    let incidents = h
        .engine
        .repos
        .incidents
        .list_open_for_upload(upload_id)
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.stage, "standardize");
    // Matched against the seeded "Unsupported file type" rule.
    assert!(incident.is_known);
    assert!(incident.matched_known_error.is_some());
    assert_eq!(incident.category.as_deref(), Some("ingest"));
    assert!(incident.corrective_action.is_some());
}
