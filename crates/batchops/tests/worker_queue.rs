//! Worker pool behavior driven through the real engine loop

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batchops::config::Config;
use batchops::kv::MemoryKvStore;
use batchops::models::{JobConfig, JobCreate, JobRun, JobRunStatus};
use batchops::repositories::{IncidentRepo, JobRepo, JobRunRepo, MemoryStore};
use batchops::utils::clock::SystemClock;
use batchops::Engine;

async fn engine_with_fast_workers(tempdir: &tempfile::TempDir) -> Arc<Engine> {
    let mut config = Config::default();
    config.storage.root = tempdir.path().to_path_buf();
    config.workers.count = 2;
    config.workers.poll_interval_secs = 1;

    Engine::new(
        config,
        MemoryStore::new().repos(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(SystemClock),
    )
    .await
    .unwrap()
}

/// Poll until the job's newest run reaches a terminal status
async fn wait_for_terminal_run(engine: &Engine, job_id: Uuid) -> JobRun {
    for _ in 0..100 {
        if let Some(run) = engine.repos.runs.latest_for_job(job_id).await.unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no run for job {job_id} reached a terminal state");
}

#[tokio::test]
async fn unknown_callable_fails_with_exit_code_two_and_no_incident() {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = engine_with_fast_workers(&tempdir).await;

    let job = engine
        .repos
        .jobs
        .create(
            JobCreate {
                name: "bad-job".to_string(),
                job_type: "callable".to_string(),
                config: JobConfig::new("nonexistent.fn"),
                schedule_cron: None,
            },
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    engine
        .queue
        .enqueue(job.id, vec![], serde_json::Map::new(), chrono::Utc::now())
        .await
        .unwrap();

    let token = CancellationToken::new();
    let run_token = token.clone();
    let engine_clone = engine.clone();
    let handle = tokio::spawn(async move { engine_clone.run(run_token).await });

    let run = wait_for_terminal_run(&engine, job.id).await;
    assert_eq!(run.status, JobRunStatus::Failed);
    assert_eq!(run.exit_code, Some(2));
    assert!(run.logs.contains("Unknown callable: nonexistent.fn"));

    // Operator error, not a data incident: nothing opened, no retry.
    let incidents = engine
        .repos
        .incidents
        .list_open_for_upload(Uuid::nil())
        .await
        .unwrap();
    assert!(incidents.is_empty());

    // The entry was acked; nothing lingers for redelivery.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.queue.depths().await.unwrap(), (0, 0, 0));

    token.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn registered_callable_runs_to_success_through_the_pool() {
    let tempdir = tempfile::tempdir().unwrap();
    let engine = engine_with_fast_workers(&tempdir).await;

    // purge_history is registered at startup and safe to run on an empty
    // store, which makes it a convenient end-to-end probe.
    let job = engine
        .repos
        .jobs
        .find_by_name("purge_history")
        .await
        .unwrap()
        .unwrap();
    engine
        .queue
        .enqueue(job.id, vec![], serde_json::Map::new(), chrono::Utc::now())
        .await
        .unwrap();

    let token = CancellationToken::new();
    let run_token = token.clone();
    let engine_clone = engine.clone();
    let handle = tokio::spawn(async move { engine_clone.run(run_token).await });

    let run = wait_for_terminal_run(&engine, job.id).await;
    assert_eq!(run.status, JobRunStatus::Success);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.logs.contains("Purged 0 job runs"));

    token.cancel();
    let _ = handle.await;
}
