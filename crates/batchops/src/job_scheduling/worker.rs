//! Worker pool
//!
//! A fixed-size pool of executors, each looping claim -> resolve ->
//! invoke -> ack. A worker runs at most one job at a time and suspends
//! only at I/O boundaries. Shutdown is cooperative between jobs; a forced
//! kill relies on lease expiry to redeliver whatever was in flight.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::callables::{CallableInvocation, CallableRegistry, JobContext};
use super::queue::JobQueue;
use super::types::ClaimedJob;
use crate::config::WorkerConfig;
use crate::errors::EngineResult;
use crate::metrics::EngineMetrics;
use crate::models::{Job, JobRunStatus, RunFinalize};
use crate::repositories::{JobRepo, JobRunRepo, Repos};
use crate::utils::clock::Clock;

/// Exit code recorded when a callable identifier cannot be resolved
pub const EXIT_UNRESOLVED_CALLABLE: i32 = 2;

/// Fixed-size pool of queue executors
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    repos: Repos,
    callables: Arc<CallableRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        repos: Repos,
        callables: Arc<CallableRegistry>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            repos,
            callables,
            clock,
            metrics,
            config,
        }
    }

    /// Run all executors until the cancellation token fires
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!("Starting worker pool with {} executors", self.config.count);
        let mut executors = JoinSet::new();

        for index in 0..self.config.count {
            let pool = self.clone();
            let token = cancellation_token.clone();
            executors.spawn(async move {
                pool.executor_loop(&format!("worker-{index}"), token).await;
            });
        }

        while executors.join_next().await.is_some() {}
        info!("Worker pool stopped");
    }

    async fn executor_loop(&self, worker_id: &str, cancellation_token: CancellationToken) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!("{} received shutdown signal", worker_id);
                    break;
                }
                _ = poll.tick() => {
                    self.drain(worker_id, &cancellation_token).await;
                }
            }
        }
    }

    /// Claim and execute until the queue is empty or shutdown is requested
    async fn drain(&self, worker_id: &str, cancellation_token: &CancellationToken) {
        loop {
            if cancellation_token.is_cancelled() {
                return;
            }
            let now = self.clock.now();
            let claimed = match self
                .queue
                .claim(worker_id, self.config.lease_duration(), now)
                .await
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => return,
                Err(e) => {
                    warn!("{} failed to claim from queue: {}", worker_id, e);
                    return;
                }
            };

            if let Err(e) = self
                .execute_claimed(worker_id, &claimed, cancellation_token)
                .await
            {
                error!(
                    "{} failed to record outcome for entry {}: {}",
                    worker_id, claimed.entry.entry_id, e
                );
            }

            if let Err(e) = self.queue.ack(worker_id, &claimed).await {
                warn!("{} ack failed: {}", worker_id, e);
            }
        }
    }

    /// Resolve the callable, open a run, invoke, and finalise
    async fn execute_claimed(
        &self,
        worker_id: &str,
        claimed: &ClaimedJob,
        cancellation_token: &CancellationToken,
    ) -> EngineResult<()> {
        let Some(job) = self.repos.jobs.find_by_id(claimed.entry.job_id).await? else {
            warn!(
                "{} claimed entry for deleted job {}; dropping",
                worker_id, claimed.entry.job_id
            );
            return Ok(());
        };

        let started_at = self.clock.now();
        let run = self
            .repos
            .runs
            .create_running(job.id, None, started_at)
            .await?;

        info!(
            "{} executing job '{}' (run {})",
            worker_id, job.name, run.id
        );

        let Some(callable) = self.callables.resolve(&job.config.callable) else {
            self.finish_unresolved(&job, run.id).await?;
            return Ok(());
        };

        let invocation = CallableInvocation {
            args: claimed.entry.args.clone(),
            kwargs: claimed.entry.kwargs.clone(),
            context: JobContext {
                run_id: run.id,
                job_id: job.id,
                job_name: job.name.clone(),
                cancellation: cancellation_token.clone(),
            },
        };

        let outcome = callable(invocation).await;

        // Callables that manage their own run record (the pipeline) have
        // already finalised it; only finish runs still marked running.
        let current = self.repos.runs.find_by_id(run.id).await?;
        let still_running = current
            .as_ref()
            .map(|r| r.status == JobRunStatus::Running)
            .unwrap_or(false);

        if !still_running {
            // The callable finalised its own run record (the pipeline
            // does); count whatever it decided.
            let status = current
                .map(|r| r.status)
                .unwrap_or(JobRunStatus::Failed);
            self.metrics.record_job_run(&job.name, status.as_str());
            return Ok(());
        }

        let finished_at = self.clock.now();
        let duration_ms = (finished_at - started_at).num_milliseconds();
        match outcome {
            Ok(logs) => {
                self.repos
                    .runs
                    .finalize(RunFinalize {
                        run_id: run.id,
                        status: JobRunStatus::Success,
                        finished_at,
                        duration_ms,
                        exit_code: 0,
                        details: current.map(|r| r.details).unwrap_or_default(),
                        logs,
                    })
                    .await?;
                self.metrics.record_job_run(&job.name, "success");
            }
            Err(e) => {
                self.repos
                    .runs
                    .finalize(RunFinalize {
                        run_id: run.id,
                        status: JobRunStatus::Failed,
                        finished_at,
                        duration_ms,
                        exit_code: 1,
                        details: current.map(|r| r.details).unwrap_or_default(),
                        logs: format!("Job failed: {e}"),
                    })
                    .await?;
                self.metrics.record_job_run(&job.name, "failed");
                warn!("Job '{}' failed (run {}): {}", job.name, run.id, e);
            }
        }

        Ok(())
    }

    /// Permanent failure for an unknown callable: exit 2, no incident,
    /// no retry
    async fn finish_unresolved(&self, job: &Job, run_id: uuid::Uuid) -> EngineResult<()> {
        let finished_at = self.clock.now();
        error!(
            "Job '{}' references unknown callable '{}'",
            job.name, job.config.callable
        );
        self.repos
            .runs
            .finalize(RunFinalize {
                run_id,
                status: JobRunStatus::Failed,
                finished_at,
                duration_ms: 0,
                exit_code: EXIT_UNRESOLVED_CALLABLE,
                details: Vec::new(),
                logs: format!("Unknown callable: {}", job.config.callable),
            })
            .await?;
        self.metrics.record_job_run(&job.name, "failed");
        Ok(())
    }
}
