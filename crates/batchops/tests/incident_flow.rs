//! Incident lifecycle: known-error auto-retry, recurrence, manual actions

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batchops::config::Config;
use batchops::errors::EngineError;
use batchops::job_scheduling::JobContext;
use batchops::kv::MemoryKvStore;
use batchops::models::{
    IncidentState, KnownErrorCreate, ProcessMode, Severity, UploadCreate, UploadStatus,
};
use batchops::pipeline::{report::build_pdf_table, PIPELINE_JOB_NAME};
use batchops::repositories::{IncidentRepo, JobRepo, JobRunRepo, KnownErrorRepo, MemoryStore, UploadRepo};
use batchops::utils::clock::{Clock, ManualClock};
use batchops::Engine;

struct Harness {
    engine: Arc<Engine>,
    clock: ManualClock,
    tempdir: tempfile::TempDir,
}

async fn harness_with_retryable_pdf_rule() -> Harness {
    let tempdir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.root = tempdir.path().to_path_buf();

    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap());

    // Seed the PDF rule with auto-retry before bootstrap so the default
    // library keys off the same pattern and leaves it alone.
    store
        .get_or_create(
            KnownErrorCreate {
                name: "No table found in PDF".to_string(),
                pattern: "No table found in first PDF page".to_string(),
                severity: Severity::Medium,
                category: "ingest".to_string(),
                corrective_action: Some("Re-export as a tabular PDF.".to_string()),
                root_cause: Some("The PDF has no extractable table.".to_string()),
                resolution_report: None,
                auto_retry: true,
                max_auto_retries: 2,
            },
            clock.now(),
        )
        .await
        .unwrap();

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
        tempdir,
    }
}

impl Harness {
    async fn upload_with_file(&self, filename: &str, bytes: &[u8]) -> Uuid {
        let upload = self
            .engine
            .repos
            .uploads
            .create(
                UploadCreate {
                    department: "General".to_string(),
                    filename: filename.to_string(),
                    notes: None,
                    process_mode: ProcessMode::Transform,
                    process_config: serde_json::json!({}),
                },
                self.clock.now(),
            )
            .await
            .unwrap();
        self.replace_file(upload.id, filename, bytes).await;
        upload.id
    }

    async fn replace_file(&self, upload_id: Uuid, filename: &str, bytes: &[u8]) {
        let dir = self.tempdir.path().join("uploads").join(upload_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(filename);
        std::fs::write(&path, bytes).unwrap();
        self.engine
            .repos
            .uploads
            .set_file_path(upload_id, path.to_str().unwrap())
            .await
            .unwrap();
    }

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
            .create_running(job.id, None, self.clock.now())
            .await
            .unwrap();
        let ctx = JobContext {
            run_id: run.id,
            job_id: job.id,
            job_name: job.name.clone(),
            cancellation: CancellationToken::new(),
        };
        self.engine.executor.execute(upload_id, &ctx).await.unwrap()
    }
}

/// A PDF whose only content is a one-word title: no table to extract
fn tableless_pdf() -> Vec<u8> {
    build_pdf_table("Report", &[], &[]).unwrap()
}

#[tokio::test]
async fn known_error_auto_retry_then_auto_resolve() {
    let h = harness_with_retryable_pdf_rule().await;
    let upload_id = h.upload_with_file("results.pdf", &tableless_pdf()).await;

    h.run_pipeline(upload_id).await;

    // First failure opens an incident with one retry consumed.
    let incident = h
        .engine
        .repos
        .incidents
        .find_open_for_stage(upload_id, "standardize")
        .await
        .unwrap()
        .unwrap();
    assert!(incident.is_known);
    assert_eq!(incident.auto_retry_count, 1);
    assert_eq!(incident.max_auto_retries, 2);
    assert_eq!(incident.state, IncidentState::InProgress);
    assert!(incident
        .timeline
        .iter()
        .any(|e| e.event == "auto_retry_scheduled"));

    // The retry sits in the delayed set until its backoff elapses.
    let (fifo, delayed, _) = h.engine.queue.depths().await.unwrap();
    assert_eq!((fifo, delayed), (0, 1));
    h.clock.advance(chrono::Duration::seconds(30));
    h.engine.queue.promote(h.clock.now()).await.unwrap();
    let claimed = h
        .engine
        .queue
        .claim("w1", chrono::Duration::minutes(10), h.clock.now())
        .await
        .unwrap()
        .expect("retry entry promoted");
    h.engine.queue.ack("w1", &claimed).await.unwrap();

    // A replacement file lands before the retry executes.
    h.replace_file(upload_id, "results.csv", b"student_id,score\nS1,80\n")
        .await;
    h.run_pipeline(upload_id).await;

    let resolved = h
        .engine
        .repos
        .incidents
        .find_by_id(incident.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.state, IncidentState::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert!(resolved.timeline.iter().any(|e| e.event == "auto_resolved"));
    // The original failure stays on the record for audit.
    assert!(resolved.error.contains("No table found in first PDF page"));

    // Timeline timestamps never move backwards.
    let timestamps: Vec<_> = resolved.timeline.iter().map(|e| e.timestamp).collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn recurrence_updates_the_open_incident_instead_of_duplicating() {
    let h = harness_with_retryable_pdf_rule().await;
    let upload_id = h.upload_with_file("results.pdf", &tableless_pdf()).await;

    h.run_pipeline(upload_id).await;
    h.run_pipeline(upload_id).await;
    h.run_pipeline(upload_id).await;

    let open = h
        .engine
        .repos
        .incidents
        .list_open_for_upload(upload_id)
        .await
        .unwrap();
    assert_eq!(open.len(), 1, "one open incident per (upload, stage)");
    let incident = &open[0];
    assert_eq!(
        incident
            .timeline
            .iter()
            .filter(|e| e.event == "recurrence")
            .count(),
        2
    );
    // Budget of two retries is exhausted, never exceeded.
    assert_eq!(incident.auto_retry_count, 2);
    assert!(incident.auto_retry_count <= incident.max_auto_retries);
    assert!(incident
        .timeline
        .iter()
        .any(|e| e.event == "auto_retry_limit_reached"));
}

#[tokio::test]
async fn manual_workflow_assign_analyze_resolve_archive() {
    let h = harness_with_retryable_pdf_rule().await;
    let upload_id = h.upload_with_file("grades.docx", b"whatever").await;
    h.run_pipeline(upload_id).await;

    let incident = h
        .engine
        .repos
        .incidents
        .list_open_for_upload(upload_id)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(incident.state, IncidentState::Open);

    let incidents = &h.engine.incidents;

    let assigned = incidents
        .assign(incident.id, "dana", "ops", None)
        .await
        .unwrap();
    assert_eq!(assigned.state, IncidentState::InProgress);
    assert_eq!(assigned.assignee.as_deref(), Some("dana"));

    let analyzed = incidents
        .analyze(
            incident.id,
            Some(Severity::High),
            Some("Nightly exam import blocked".to_string()),
            Some("File exported in the wrong format".to_string()),
            "dana",
        )
        .await
        .unwrap();
    assert_eq!(analyzed.severity, Severity::High);

    // Archiving before resolution is rejected.
    assert!(matches!(
        incidents.archive(incident.id, "dana", None).await,
        Err(EngineError::Repository(_))
    ));

    let resolved = incidents
        .resolve(
            incident.id,
            Some("Wrong export format".to_string()),
            Some("Re-export as CSV".to_string()),
            Some("Operator re-uploaded a CSV export".to_string()),
            "dana",
        )
        .await
        .unwrap();
    assert_eq!(resolved.state, IncidentState::Resolved);
    assert!(resolved.resolved_at.is_some());

    let archived = incidents.archive(incident.id, "dana", None).await.unwrap();
    assert_eq!(archived.state, IncidentState::Archived);
    assert!(archived.archived_at.is_some());
    assert!(archived.resolved_at.is_some());

    // Nothing mutates an archived incident.
    assert!(incidents
        .resolve(incident.id, None, None, None, "dana")
        .await
        .is_err());
    assert!(incidents.retry(incident.id, "dana", None).await.is_err());
}

#[tokio::test]
async fn manual_retry_requeues_and_moves_failed_upload_to_pending() {
    let h = harness_with_retryable_pdf_rule().await;
    let upload_id = h.upload_with_file("grades.docx", b"whatever").await;
    h.run_pipeline(upload_id).await;

    let incident = h
        .engine
        .repos
        .incidents
        .list_open_for_upload(upload_id)
        .await
        .unwrap()
        .remove(0);

    let retried = h
        .engine
        .incidents
        .retry(incident.id, "ops", Some("replacement uploaded".to_string()))
        .await
        .unwrap();
    assert_eq!(retried.state, IncidentState::InProgress);
    assert!(retried.timeline.iter().any(|e| e.event == "manual_retry"));

    let upload = h
        .engine
        .repos
        .uploads
        .find_by_id(upload_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upload.status, UploadStatus::Pending);

    // The retry is an immediate FIFO entry.
    let claimed = h
        .engine
        .queue
        .claim("w1", chrono::Duration::minutes(10), h.clock.now())
        .await
        .unwrap()
        .expect("pipeline entry enqueued");
    assert_eq!(
        claimed.entry.args.first().and_then(|v| v.as_str()),
        Some(upload_id.to_string().as_str())
    );
}
