//! Engine assembly
//!
//! Wires the repositories, key/value store, queue, schedule registry,
//! callable registry, pipeline executor, incident writer and ingest
//! generators into one runnable unit, and seeds the bootstrap rows
//! (default jobs and the known-error library) idempotently.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{EngineError, EngineResult};
use crate::incidents::seed::ensure_default_known_errors;
use crate::incidents::IncidentWriter;
use crate::ingest::IngestService;
use crate::job_scheduling::{
    CallableRegistry, JobQueue, ScheduleRegistry, SchedulerService, WorkerPool,
};
use crate::kv::KvStore;
use crate::metrics::EngineMetrics;
use crate::models::{JobConfig, JobCreate};
use crate::pipeline::{PipelineExecutor, PIPELINE_JOB_NAME};
use crate::repositories::{JobRepo, Repos};
use crate::utils::clock::Clock;

/// Scheduled jobs seeded at bootstrap: (name, callable, cron, kwargs)
const DEFAULT_JOBS: [(&str, &str, Option<&str>, &str); 4] = [
    (PIPELINE_JOB_NAME, "pipeline.process_upload", None, "{}"),
    (
        "department_ingest",
        "ingest.department_feed",
        Some("5 6 * * *"),
        "{\"department\": \"General\"}",
    ),
    (
        "all_departments_ingest",
        "ingest.all_departments",
        Some("35 6 * * 1"),
        "{}",
    ),
    (
        "purge_history",
        "maintenance.purge_history",
        Some("20 2 * * 0"),
        "{}",
    ),
];

/// Fully wired engine
pub struct Engine {
    pub repos: Repos,
    pub queue: Arc<JobQueue>,
    pub schedule_registry: Arc<ScheduleRegistry>,
    pub callables: Arc<CallableRegistry>,
    pub scheduler: Arc<SchedulerService>,
    pub workers: Arc<WorkerPool>,
    pub incidents: Arc<IncidentWriter>,
    pub executor: Arc<PipelineExecutor>,
    pub ingest: Arc<IngestService>,
    pub metrics: Arc<EngineMetrics>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Assemble the engine and seed bootstrap rows
    pub async fn new(
        config: Config,
        repos: Repos,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Arc<Self>> {
        let metrics = Arc::new(EngineMetrics::new());
        let queue = Arc::new(JobQueue::new(kv.clone()));
        let schedule_registry = Arc::new(ScheduleRegistry::new(kv.clone(), queue.clone()));

        let incidents = Arc::new(IncidentWriter::new(
            repos.clone(),
            queue.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            repos.clone(),
            kv.clone(),
            incidents.clone(),
            config.storage.clone(),
            config.pipeline.clone(),
            clock.clone(),
        ));
        let ingest = Arc::new(IngestService::new(
            repos.clone(),
            queue.clone(),
            config.storage.clone(),
            config.ingest.clone(),
            clock.clone(),
        ));

        let callables = Arc::new(CallableRegistry::new());
        register_callables(&callables, executor.clone(), ingest.clone());

        let scheduler = Arc::new(SchedulerService::new(
            schedule_registry.clone(),
            queue.clone(),
            repos.clone(),
            clock.clone(),
            config.scheduler.clone(),
        ));
        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            repos.clone(),
            callables.clone(),
            clock.clone(),
            metrics.clone(),
            config.workers.clone(),
        ));

        let engine = Arc::new(Self {
            repos,
            queue,
            schedule_registry,
            callables,
            scheduler,
            workers,
            incidents,
            executor,
            ingest,
            metrics,
            clock,
        });
        engine.bootstrap().await?;
        Ok(engine)
    }

    /// Seed the known-error library and the default job definitions
    async fn bootstrap(&self) -> EngineResult<()> {
        let now = self.clock.now();
        let seeded = ensure_default_known_errors(&self.repos.known_errors, now).await?;
        info!("Known-error library ready ({} rules)", seeded);

        for (name, callable, cron, kwargs) in DEFAULT_JOBS {
            if self.repos.jobs.find_by_name(name).await?.is_some() {
                continue;
            }
            let mut config = JobConfig::new(callable);
            config.kwargs = serde_json::from_str(kwargs)
                .map_err(|e| EngineError::internal(format!("bad seed kwargs for {name}: {e}")))?;
            self.repos
                .jobs
                .create(
                    JobCreate {
                        name: name.to_string(),
                        job_type: "callable".to_string(),
                        config,
                        schedule_cron: cron.map(str::to_string),
                    },
                    now,
                )
                .await?;
            info!("Seeded job '{}'", name);
        }

        Ok(())
    }

    /// Run scheduler loop and worker pool until shutdown
    pub async fn run(&self, cancellation_token: CancellationToken) -> EngineResult<()> {
        let scheduler = self.scheduler.clone();
        let scheduler_token = cancellation_token.clone();
        let scheduler_task = tokio::spawn(async move {
            if let Err(e) = scheduler.run(scheduler_token).await {
                tracing::error!("Scheduler loop failed: {}", e);
            }
        });

        let workers = self.workers.clone();
        let worker_task = tokio::spawn(workers.run(cancellation_token));

        let _ = tokio::join!(scheduler_task, worker_task);
        Ok(())
    }

    /// Enqueue an immediate pipeline execution for an upload
    ///
    /// The entry point the surface calls after storing an uploaded file.
    pub async fn enqueue_pipeline_for(&self, upload_id: Uuid) -> EngineResult<()> {
        let Some(job) = self.repos.jobs.find_by_name(PIPELINE_JOB_NAME).await? else {
            return Err(EngineError::internal(format!(
                "pipeline job '{PIPELINE_JOB_NAME}' is not registered"
            )));
        };
        self.queue
            .enqueue(
                job.id,
                vec![serde_json::Value::String(upload_id.to_string())],
                serde_json::Map::new(),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Re-align schedules after a job mutation; the surface calls this
    /// explicitly instead of relying on save-side effects
    pub async fn reconcile_schedules(&self) -> EngineResult<usize> {
        self.scheduler.reconcile().await
    }
}

/// Bind the symbolic callable identifiers to their entry points
fn register_callables(
    callables: &CallableRegistry,
    executor: Arc<PipelineExecutor>,
    ingest: Arc<IngestService>,
) {
    {
        let executor = executor.clone();
        callables.register("pipeline.process_upload", move |invocation| {
            let executor = executor.clone();
            Box::pin(async move {
                let raw = invocation
                    .args
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::internal(
                            "pipeline.process_upload requires an upload id argument",
                        )
                    })?;
                let upload_id = Uuid::parse_str(raw)
                    .map_err(|e| EngineError::internal(format!("invalid upload id '{raw}': {e}")))?;
                executor.execute(upload_id, &invocation.context).await
            })
        });
    }

    {
        let ingest = ingest.clone();
        callables.register("ingest.department_feed", move |invocation| {
            let ingest = ingest.clone();
            Box::pin(async move {
                let department = invocation
                    .kwargs
                    .get("department")
                    .and_then(|v| v.as_str())
                    .unwrap_or("General")
                    .to_string();
                ingest.ingest_department(&department).await
            })
        });
    }

    {
        let ingest = ingest.clone();
        callables.register("ingest.all_departments", move |_invocation| {
            let ingest = ingest.clone();
            Box::pin(async move { ingest.ingest_all_departments().await })
        });
    }

    callables.register("maintenance.purge_history", move |invocation| {
        let ingest = ingest.clone();
        Box::pin(async move {
            let days = invocation.kwargs.get("days").and_then(|v| v.as_i64());
            ingest.purge_history(days).await
        })
    });
}
