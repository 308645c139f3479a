//! Cron dispatch guarantees across scheduler restarts

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use batchops::config::SchedulerConfig;
use batchops::job_scheduling::{JobQueue, ScheduleRegistry, SchedulerService};
use batchops::kv::{KvStore, MemoryKvStore};
use batchops::models::{JobConfig, JobCreate};
use batchops::repositories::{JobRepo, MemoryStore, Repos};
use batchops::utils::clock::{Clock, ManualClock};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
}

struct Cluster {
    store: Arc<MemoryKvStore>,
    repos: Repos,
    clock: ManualClock,
}

impl Cluster {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            repos: MemoryStore::new().repos(),
            clock: ManualClock::new(start),
        }
    }

    /// Boot a scheduler process against the shared store
    fn boot(&self) -> (Arc<JobQueue>, Arc<ScheduleRegistry>, SchedulerService) {
        let queue = Arc::new(JobQueue::new(self.store.clone()));
        let registry = Arc::new(ScheduleRegistry::new(self.store.clone(), queue.clone()));
        let scheduler = SchedulerService::new(
            registry.clone(),
            queue.clone(),
            self.repos.clone(),
            Arc::new(self.clock.clone()),
            SchedulerConfig::default(),
        );
        (queue, registry, scheduler)
    }

    async fn seed_job(&self, cron: &str) -> Uuid {
        self.repos
            .jobs
            .create(
                JobCreate {
                    name: "five_minutely".to_string(),
                    job_type: "callable".to_string(),
                    config: JobConfig::new("demo.noop"),
                    schedule_cron: Some(cron.to_string()),
                },
                self.clock.now(),
            )
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn exactly_one_enqueue_per_fire_across_restart() {
    let cluster = Cluster::new(at(12, 1));
    let job_id = cluster.seed_job("*/5 * * * *").await;

    // First scheduler instance comes up and registers the schedule.
    let (queue1, registry1, scheduler1) = cluster.boot();
    scheduler1.reconcile().await.unwrap();

    // 12:05 arrives. Simulate a crash in the middle of dispatch: the
    // enqueue lands but mark_dispatched never runs.
    cluster.clock.set(at(12, 5));
    let due = registry1.due(at(12, 5)).await.unwrap();
    assert_eq!(due, vec![(job_id, at(12, 5))]);
    queue1
        .enqueue_at(job_id, vec![], serde_json::Map::new(), at(12, 5))
        .await
        .unwrap();
    drop(scheduler1);
    drop(registry1);
    drop(queue1);

    // Restart at 12:06. The new instance re-derives the pending fire and
    // dispatches it again; the delayed key collapses the duplicate.
    cluster.clock.set(at(12, 6));
    let (queue2, registry2, scheduler2) = cluster.boot();
    scheduler2.reconcile().await.unwrap();
    scheduler2.tick_once(at(12, 6)).await.unwrap();

    let first = queue2
        .claim("w1", chrono::Duration::minutes(10), at(12, 6))
        .await
        .unwrap();
    assert!(first.is_some(), "the 12:05 fire must be delivered");
    assert_eq!(first.unwrap().entry.job_id, job_id);

    let second = queue2
        .claim("w1", chrono::Duration::minutes(10), at(12, 6))
        .await
        .unwrap();
    assert!(second.is_none(), "exactly one enqueue for the 12:05 fire");

    // The fire was marked dispatched, so it never comes back.
    assert!(registry2.due(at(12, 6)).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_ticks_do_not_double_dispatch() {
    let cluster = Cluster::new(at(12, 1));
    let job_id = cluster.seed_job("*/5 * * * *").await;
    let (queue, _registry, scheduler) = cluster.boot();
    scheduler.reconcile().await.unwrap();

    cluster.clock.set(at(12, 5));
    scheduler.tick_once(at(12, 5)).await.unwrap();
    scheduler.tick_once(at(12, 5)).await.unwrap();
    scheduler.tick_once(at(12, 5)).await.unwrap();

    let mut delivered = 0;
    while queue
        .claim("w1", chrono::Duration::minutes(10), at(12, 5))
        .await
        .unwrap()
        .is_some()
    {
        delivered += 1;
    }
    assert_eq!(delivered, 1);
    let _ = job_id;
}

#[tokio::test]
async fn consecutive_fires_dispatch_in_order() {
    let cluster = Cluster::new(at(12, 1));
    cluster.seed_job("*/5 * * * *").await;
    let (queue, _registry, scheduler) = cluster.boot();
    scheduler.reconcile().await.unwrap();

    for minute in [5u32, 10, 15] {
        cluster.clock.set(at(12, minute));
        scheduler.tick_once(at(12, minute)).await.unwrap();
    }

    let mut fire_times = Vec::new();
    while let Some(claimed) = queue
        .claim("w1", chrono::Duration::minutes(10), at(12, 15))
        .await
        .unwrap()
    {
        fire_times.push(claimed.entry.enqueued_at);
    }
    assert_eq!(fire_times, vec![at(12, 5), at(12, 10), at(12, 15)]);
}

/// Store wrapper that fails every operation, for outage behavior
struct UnreachableKv;

#[async_trait::async_trait]
impl KvStore for UnreachableKv {
    async fn get(&self, _key: &str) -> batchops::errors::QueueResult<Option<String>> {
        Err(batchops::kv::store_unavailable("connection refused"))
    }
    async fn put(&self, _key: &str, _value: String) -> batchops::errors::QueueResult<()> {
        Err(batchops::kv::store_unavailable("connection refused"))
    }
    async fn delete(&self, _key: &str) -> batchops::errors::QueueResult<()> {
        Err(batchops::kv::store_unavailable("connection refused"))
    }
    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<String>,
    ) -> batchops::errors::QueueResult<bool> {
        Err(batchops::kv::store_unavailable("connection refused"))
    }
    async fn scan_prefix(
        &self,
        _prefix: &str,
    ) -> batchops::errors::QueueResult<Vec<(String, String)>> {
        Err(batchops::kv::store_unavailable("connection refused"))
    }
}

#[tokio::test]
async fn due_surfaces_transient_error_when_store_is_down() {
    let store: Arc<dyn KvStore> = Arc::new(UnreachableKv);
    let queue = Arc::new(JobQueue::new(store.clone()));
    let registry = ScheduleRegistry::new(store, queue);

    let err = registry.due(at(12, 0)).await.unwrap_err();
    assert!(err.is_transient());
}
