//! Scheduler loop
//!
//! One loop per deployment. Each tick promotes due delayed entries, asks
//! the registry for due cron fires, and for each fire enqueues it and then
//! marks it dispatched. The delayed set deduplicates on (job, fire time),
//! so a crash between the enqueue and the mark costs nothing: the next
//! tick re-derives the same pending fire and lands on the same key.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::registry::ScheduleRegistry;
use crate::config::SchedulerConfig;
use crate::errors::{EngineError, EngineResult};
use crate::repositories::{JobRepo, Repos};
use crate::utils::clock::Clock;

/// Cron dispatch service
pub struct SchedulerService {
    registry: Arc<ScheduleRegistry>,
    queue: Arc<JobQueue>,
    repos: Repos,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(
        registry: Arc<ScheduleRegistry>,
        queue: Arc<JobQueue>,
        repos: Repos,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            repos,
            clock,
            config,
        }
    }

    /// Run the scheduler until the cancellation token fires
    ///
    /// Starts with a reconcile against the job table; missed fires from
    /// downtime are not replayed, the next future fire is computed from
    /// now. Transient store failures back the loop off instead of
    /// killing it.
    pub async fn run(&self, cancellation_token: CancellationToken) -> EngineResult<()> {
        info!(
            "Starting scheduler loop (tick every {:?})",
            self.config.tick_interval()
        );
        self.reconcile().await?;

        let base_interval = self.config.tick_interval();
        let mut backoff: u32 = 0;

        loop {
            let sleep_for = base_interval * 2u32.saturating_pow(backoff.min(3));
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {
                    match self.tick_once(self.clock.now()).await {
                        Ok(dispatched) => {
                            if dispatched > 0 {
                                debug!("Dispatched {} cron fires", dispatched);
                            }
                            backoff = 0;
                        }
                        Err(EngineError::Queue(e)) if e.is_transient() => {
                            backoff += 1;
                            warn!("Store unavailable, backing off scheduler tick: {}", e);
                        }
                        Err(e) => {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                }
            }
        }

        info!("Scheduler loop stopped");
        Ok(())
    }

    /// One scheduler tick: promote, enumerate due fires, dispatch each
    pub async fn tick_once(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.queue.promote(now).await?;

        let due = self.registry.due(now).await?;
        let mut dispatched = 0;

        for (job_id, fire_time) in due {
            let Some(job) = self.repos.jobs.find_by_id(job_id).await? else {
                warn!("Schedule references deleted job {}; unregistering", job_id);
                self.registry.unregister(job_id).await?;
                continue;
            };

            self.queue
                .enqueue_at(
                    job_id,
                    job.config.args.clone(),
                    job.config.kwargs.clone(),
                    fire_time,
                )
                .await?;
            self.registry.mark_dispatched(job_id, fire_time).await?;
            dispatched += 1;
        }

        if dispatched > 0 {
            // Fire times are in the past by definition; surface them to the
            // FIFO without waiting out another tick.
            self.queue.promote(now).await?;
        }

        Ok(dispatched)
    }

    /// Align the registry with the authoritative job table
    ///
    /// Invoked at startup and by the surface after any job mutation; no
    /// implicit side effects on save.
    pub async fn reconcile(&self) -> EngineResult<usize> {
        let jobs = self.repos.jobs.list_all().await?;
        let changed = self.registry.reconcile(&jobs, self.clock.now()).await?;
        info!("Schedule reconcile complete ({} jobs examined)", jobs.len());
        Ok(changed)
    }
}
