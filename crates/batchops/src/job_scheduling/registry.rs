//! Durable schedule registry
//!
//! Maps job definitions to their cron expressions and tracks, per job, the
//! next computed fire time plus the last fire whose enqueue was recorded.
//! State lives in the key/value store under `schedule:{job_id}` so the
//! pending-dispatch picture survives process restarts; `due` re-derives
//! pending fires from `last_dispatched`, never from scheduler memory.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cron::CronSpec;
use super::queue::JobQueue;
use super::types::ScheduleEntry;
use crate::errors::{EngineError, EngineResult, QueueResult};
use crate::kv::KvStore;
use crate::models::Job;

const SCHEDULE_PREFIX: &str = "schedule:";

/// Registry of cron-scheduled jobs
pub struct ScheduleRegistry {
    store: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
}

impl ScheduleRegistry {
    pub fn new(store: Arc<dyn KvStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    fn schedule_key(job_id: Uuid) -> String {
        format!("{SCHEDULE_PREFIX}{job_id}")
    }

    /// Register or replace a job's schedule
    ///
    /// Idempotent: re-registering with an unchanged expression keeps the
    /// already-computed next fire, so repeated reconciles do not push
    /// fires into the future. A changed expression recomputes from `now`.
    pub async fn register(&self, job_id: Uuid, cron: &str, now: DateTime<Utc>) -> EngineResult<()> {
        let spec = CronSpec::parse(cron)?;
        let key = Self::schedule_key(job_id);

        if let Some(raw) = self.store.get(&key).await? {
            if let Ok(existing) = serde_json::from_str::<ScheduleEntry>(&raw) {
                if existing.cron == cron {
                    return Ok(());
                }
            }
        }

        let next_fire = spec.next_fire_after(now).ok_or_else(|| {
            EngineError::MalformedSchedule {
                expression: cron.to_string(),
                message: "expression has no future fire times".to_string(),
            }
        })?;

        let entry = ScheduleEntry {
            cron: cron.to_string(),
            next_fire,
            last_dispatched: None,
        };
        self.store
            .put(&key, serde_json::to_string(&entry).map_err(crate::errors::QueueError::from)?)
            .await?;
        info!("Registered schedule '{}' for job {} (next fire {})", cron, job_id, next_fire);
        Ok(())
    }

    /// Remove a job's schedule and any not-yet-fired pending dispatch
    pub async fn unregister(&self, job_id: Uuid) -> QueueResult<()> {
        self.store.delete(&Self::schedule_key(job_id)).await?;
        let cancelled = self.queue.cancel_delayed(job_id).await?;
        if cancelled > 0 {
            debug!("Cancelled {} pending dispatches for job {}", cancelled, job_id);
        }
        Ok(())
    }

    /// Fires with `fire_time <= now` that have not been marked dispatched
    pub async fn due(&self, now: DateTime<Utc>) -> QueueResult<Vec<(Uuid, DateTime<Utc>)>> {
        let mut due = Vec::new();
        for (key, raw) in self.store.scan_prefix(SCHEDULE_PREFIX).await? {
            let Ok(job_id) = Uuid::parse_str(&key[SCHEDULE_PREFIX.len()..]) else {
                warn!("Skipping schedule entry with malformed key '{}'", key);
                continue;
            };
            let entry: ScheduleEntry = serde_json::from_str(&raw)?;
            if entry.next_fire <= now && entry.last_dispatched != Some(entry.next_fire) {
                due.push((job_id, entry.next_fire));
            }
        }
        Ok(due)
    }

    /// Record that the fire at `fire_time` was enqueued and advance the
    /// schedule to the following fire
    ///
    /// Uses compare-and-swap on the schedule entry so a concurrent
    /// mutation (re-register, unregister) makes the mark a no-op rather
    /// than resurrecting stale state.
    pub async fn mark_dispatched(
        &self,
        job_id: Uuid,
        fire_time: DateTime<Utc>,
    ) -> EngineResult<()> {
        let key = Self::schedule_key(job_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(());
        };
        let entry: ScheduleEntry =
            serde_json::from_str(&raw).map_err(crate::errors::QueueError::from)?;
        if entry.next_fire != fire_time {
            return Ok(());
        }

        let spec = CronSpec::parse(&entry.cron)?;
        let next_fire = spec.next_fire_after(fire_time).ok_or_else(|| {
            EngineError::MalformedSchedule {
                expression: entry.cron.clone(),
                message: "expression has no future fire times".to_string(),
            }
        })?;

        let updated = ScheduleEntry {
            cron: entry.cron,
            next_fire,
            last_dispatched: Some(fire_time),
        };
        self.store
            .compare_and_swap(
                &key,
                Some(&raw),
                Some(serde_json::to_string(&updated).map_err(crate::errors::QueueError::from)?),
            )
            .await?;
        Ok(())
    }

    /// Align the registry with the authoritative job set
    ///
    /// Adds missing registrations, updates changed expressions, and
    /// removes orphans (deleted jobs or jobs whose schedule was cleared).
    /// A malformed expression on one job is logged and skipped so it
    /// cannot wedge the reconcile of the rest.
    pub async fn reconcile(&self, jobs: &[Job], now: DateTime<Utc>) -> EngineResult<usize> {
        let mut scheduled_ids = HashSet::new();
        let mut changed = 0;

        for job in jobs {
            if let Some(cron) = job.schedule_cron.as_deref() {
                scheduled_ids.insert(job.id);
                match self.register(job.id, cron, now).await {
                    Ok(()) => changed += 1,
                    Err(e) => warn!("Skipping schedule for job '{}': {}", job.name, e),
                }
            }
        }

        for (key, _) in self.store.scan_prefix(SCHEDULE_PREFIX).await? {
            if let Ok(job_id) = Uuid::parse_str(&key[SCHEDULE_PREFIX.len()..]) {
                if !scheduled_ids.contains(&job_id) {
                    self.unregister(job_id).await?;
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::models::{JobConfig, JobCreate};
    use chrono::TimeZone;

    fn setup() -> (Arc<MemoryKvStore>, Arc<JobQueue>, ScheduleRegistry) {
        let store = Arc::new(MemoryKvStore::new());
        let queue = Arc::new(JobQueue::new(store.clone()));
        let registry = ScheduleRegistry::new(store.clone(), queue.clone());
        (store, queue, registry)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    fn job_with_cron(name: &str, cron: Option<&str>) -> Job {
        let create = JobCreate {
            name: name.to_string(),
            job_type: "callable".to_string(),
            config: JobConfig::new("test.fn"),
            schedule_cron: cron.map(str::to_string),
        };
        Job {
            id: Uuid::new_v4(),
            name: create.name,
            job_type: create.job_type,
            config: create.config,
            schedule_cron: create.schedule_cron,
            created_at: at(0, 0),
            updated_at: at(0, 0),
        }
    }

    #[tokio::test]
    async fn due_reports_only_past_undispatched_fires() {
        let (_, _, registry) = setup();
        let job_id = Uuid::new_v4();

        registry.register(job_id, "*/5 * * * *", at(12, 0)).await.unwrap();

        // Next fire computed as 12:05; nothing due at 12:04.
        assert!(registry.due(at(12, 4)).await.unwrap().is_empty());

        let due = registry.due(at(12, 5)).await.unwrap();
        assert_eq!(due, vec![(job_id, at(12, 5))]);

        registry.mark_dispatched(job_id, at(12, 5)).await.unwrap();
        assert!(registry.due(at(12, 5)).await.unwrap().is_empty());

        // The following fire becomes due a tick later.
        let due = registry.due(at(12, 10)).await.unwrap();
        assert_eq!(due, vec![(job_id, at(12, 10))]);
    }

    #[tokio::test]
    async fn register_is_idempotent_for_unchanged_cron() {
        let (store, _, registry) = setup();
        let job_id = Uuid::new_v4();

        registry.register(job_id, "0 9 * * *", at(8, 0)).await.unwrap();
        let before = store.get(&ScheduleRegistry::schedule_key(job_id)).await.unwrap();

        registry.register(job_id, "0 9 * * *", at(10, 0)).await.unwrap();
        let after = store.get(&ScheduleRegistry::schedule_key(job_id)).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn register_rejects_malformed_schedule() {
        let (_, _, registry) = setup();
        let err = registry
            .register(Uuid::new_v4(), "not a cron", at(8, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedSchedule { .. }));
    }

    #[tokio::test]
    async fn unregister_cancels_pending_dispatch() {
        let (_, queue, registry) = setup();
        let job_id = Uuid::new_v4();

        registry.register(job_id, "*/5 * * * *", at(12, 0)).await.unwrap();
        queue
            .enqueue_at(job_id, vec![], serde_json::Map::new(), at(12, 5))
            .await
            .unwrap();

        registry.unregister(job_id).await.unwrap();

        assert!(registry.due(at(12, 10)).await.unwrap().is_empty());
        assert_eq!(queue.promote(at(12, 10)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_adds_and_removes_registrations() {
        let (_, _, registry) = setup();
        let scheduled = job_with_cron("nightly", Some("0 2 * * *"));
        let manual = job_with_cron("manual-only", None);
        let orphan_id = Uuid::new_v4();
        registry.register(orphan_id, "* * * * *", at(0, 0)).await.unwrap();

        registry
            .reconcile(&[scheduled.clone(), manual], at(1, 0))
            .await
            .unwrap();

        let due = registry.due(at(2, 0)).await.unwrap();
        assert_eq!(due, vec![(scheduled.id, at(2, 0))]);
    }

    #[tokio::test]
    async fn missed_fires_are_not_replayed_after_downtime() {
        let (_, _, registry) = setup();
        let job = job_with_cron("hourly", Some("0 * * * *"));

        // Startup reconcile at 09:30 after hours of downtime: the next
        // future fire is 10:00, not a backlog of missed hours.
        registry.reconcile(&[job.clone()], at(9, 30)).await.unwrap();
        assert!(registry.due(at(9, 30)).await.unwrap().is_empty());
        assert_eq!(registry.due(at(10, 0)).await.unwrap(), vec![(job.id, at(10, 0))]);
    }
}
