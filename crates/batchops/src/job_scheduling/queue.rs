//! Job queue over the key/value store
//!
//! Two logical structures share the store: a FIFO of runnable entries and
//! a delayed set keyed by target fire time. Keys sort so that a prefix
//! scan walks entries in execution order:
//!
//! ```text
//! queue:fifo:{millis:020}:{job_id}:{hash}       -> QueueEntry
//! queue:delayed:{millis:020}:{job_id}:{hash}    -> QueueEntry
//! queue:lease:{millis:020}:{job_id}:{hash}      -> Lease
//! ```
//!
//! Keys are deterministic per (time, job, payload), never per attempt:
//! replaying any half-finished transition lands on the same key instead
//! of minting a sibling, which is what bounds every (job, fire time) pair
//! to one enqueue no matter where a crash falls.
//!
//! Delivery is at-least-once: a claim writes the lease before removing the
//! FIFO entry, so a crash at any point either leaves the entry claimable
//! or leaves an expired lease for the sweep to requeue. Consumers must be
//! idempotent.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{ClaimedJob, Lease, QueueEntry};
use crate::errors::{QueueError, QueueResult};
use crate::kv::KvStore;

const FIFO_PREFIX: &str = "queue:fifo:";
const DELAYED_PREFIX: &str = "queue:delayed:";
const LEASE_PREFIX: &str = "queue:lease:";

/// FIFO + delayed-set job queue
pub struct JobQueue {
    store: Arc<dyn KvStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// `{millis}:{job}:{hash}`, shared by all three key families
    fn entry_suffix(at: DateTime<Utc>, entry: &QueueEntry) -> String {
        format!(
            "{:020}:{}:{:016x}",
            at.timestamp_millis(),
            entry.job_id,
            entry.args_fingerprint(),
        )
    }

    fn fifo_key(entry: &QueueEntry) -> String {
        format!("{FIFO_PREFIX}{}", Self::entry_suffix(entry.enqueued_at, entry))
    }

    fn delayed_key(at: DateTime<Utc>, entry: &QueueEntry) -> String {
        format!("{DELAYED_PREFIX}{}", Self::entry_suffix(at, entry))
    }

    fn lease_key_for(fifo_key: &str) -> String {
        format!("{LEASE_PREFIX}{}", &fifo_key[FIFO_PREFIX.len()..])
    }

    /// Append an immediately-runnable entry to the FIFO
    pub async fn enqueue(
        &self,
        job_id: Uuid,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> QueueResult<QueueEntry> {
        let entry = QueueEntry::new(job_id, args, kwargs, now);
        let key = Self::fifo_key(&entry);
        self.store.put(&key, serde_json::to_string(&entry)?).await?;
        debug!("Enqueued job {} as {}", job_id, entry.entry_id);
        Ok(entry)
    }

    /// Insert an entry into the delayed set for execution at `at`
    ///
    /// Idempotent per (job, fire time, payload): re-inserting overwrites
    /// the same delayed key, which is what keeps the scheduler's
    /// crash-between-enqueue-and-mark window at one enqueue.
    pub async fn enqueue_at(
        &self,
        job_id: Uuid,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        at: DateTime<Utc>,
    ) -> QueueResult<QueueEntry> {
        let entry = QueueEntry::new(job_id, args, kwargs, at);
        let key = Self::delayed_key(at, &entry);
        self.store.put(&key, serde_json::to_string(&entry)?).await?;
        debug!("Scheduled job {} for {}", job_id, at);
        Ok(entry)
    }

    /// Move due delayed entries into the FIFO and requeue expired leases
    ///
    /// Promotion preserves relative target order because delayed keys sort
    /// by fire time and each promoted entry keeps its fire time as FIFO
    /// position. The promoted FIFO key is deterministic, so a crash after
    /// the FIFO write and before the delayed delete re-promotes onto the
    /// same key instead of duplicating.
    pub async fn promote(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        self.sweep_expired_leases(now).await?;

        let cutoff = format!("{DELAYED_PREFIX}{:020}", now.timestamp_millis() + 1);
        let mut promoted = 0;

        for (key, payload) in self.store.scan_prefix(DELAYED_PREFIX).await? {
            if key.as_str() >= cutoff.as_str() {
                break;
            }
            let entry: QueueEntry = serde_json::from_str(&payload)?;
            let fifo_key = Self::fifo_key(&entry);
            self.store.put(&fifo_key, payload).await?;
            self.store.delete(&key).await?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!("Promoted {} delayed entries", promoted);
        }
        Ok(promoted)
    }

    /// Atomically claim the oldest unleased FIFO entry
    ///
    /// Returns `None` when the queue is empty. The lease is written before
    /// the FIFO entry is removed; another worker may re-claim only after
    /// the lease expires.
    pub async fn claim(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<ClaimedJob>> {
        for (fifo_key, payload) in self.store.scan_prefix(FIFO_PREFIX).await? {
            let entry: QueueEntry = serde_json::from_str(&payload)?;
            let lease_key = Self::lease_key_for(&fifo_key);
            let lease = Lease {
                worker_id: worker_id.to_string(),
                expires_at: now + lease_duration,
                fifo_key: fifo_key.clone(),
                entry: entry.clone(),
            };

            let acquired = self
                .store
                .compare_and_swap(&lease_key, None, Some(serde_json::to_string(&lease)?))
                .await?;
            if !acquired {
                // Another worker holds this entry; expired leases are the
                // sweep's business, not the claim path's.
                continue;
            }

            self.store
                .compare_and_swap(&fifo_key, Some(&payload), None)
                .await?;

            debug!("Worker {} claimed entry {}", worker_id, entry.entry_id);
            return Ok(Some(ClaimedJob {
                entry,
                worker_id: worker_id.to_string(),
                lease_key,
            }));
        }
        Ok(None)
    }

    /// Release the lease after the entry has been fully handled
    ///
    /// Both a successful run and a recorded failure ack; only a crashed
    /// worker leaves its lease to expire.
    pub async fn ack(&self, worker_id: &str, claimed: &ClaimedJob) -> QueueResult<()> {
        let Some(raw) = self.store.get(&claimed.lease_key).await? else {
            // Lease already expired and was swept; the entry will rerun.
            warn!(
                "Ack for entry {} found no lease; it may be redelivered",
                claimed.entry.entry_id
            );
            return Ok(());
        };
        let lease: Lease = serde_json::from_str(&raw)?;
        if lease.worker_id != worker_id {
            return Err(QueueError::LeaseNotHeld {
                worker: worker_id.to_string(),
                job_id: claimed.entry.job_id.to_string(),
            });
        }
        self.store.delete(&lease.fifo_key).await?;
        self.store.delete(&claimed.lease_key).await?;
        Ok(())
    }

    /// Drop not-yet-fired delayed entries for a job
    ///
    /// Used when a job is unregistered so a stale schedule cannot fire.
    pub async fn cancel_delayed(&self, job_id: Uuid) -> QueueResult<usize> {
        let mut removed = 0;
        for (key, payload) in self.store.scan_prefix(DELAYED_PREFIX).await? {
            let entry: QueueEntry = serde_json::from_str(&payload)?;
            if entry.job_id == job_id {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Requeue entries whose lease expired before an ack arrived
    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let mut requeued = 0;
        for (lease_key, raw) in self.store.scan_prefix(LEASE_PREFIX).await? {
            let lease: Lease = serde_json::from_str(&raw)?;
            if lease.expires_at > now {
                continue;
            }

            if self.store.get(&lease.fifo_key).await?.is_none() {
                // The claim completed; put the entry back at its old position.
                let payload = serde_json::to_string(&lease.entry)?;
                self.store.put(&lease.fifo_key, payload).await?;
                requeued += 1;
                warn!(
                    "Lease for entry {} expired; requeued for redelivery",
                    lease.entry.entry_id
                );
            }
            self.store.delete(&lease_key).await?;
        }
        Ok(requeued)
    }

    /// Counts for observability: (fifo, delayed, leased)
    pub async fn depths(&self) -> QueueResult<(usize, usize, usize)> {
        Ok((
            self.store.scan_prefix(FIFO_PREFIX).await?.len(),
            self.store.scan_prefix(DELAYED_PREFIX).await?.len(),
            self.store.scan_prefix(LEASE_PREFIX).await?.len(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use chrono::TimeZone;

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryKvStore::new()))
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn fifo_preserves_enqueue_order() {
        let queue = queue();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        queue
            .enqueue(a, vec![], serde_json::Map::new(), at(9, 0))
            .await
            .unwrap();
        queue
            .enqueue(b, vec![], serde_json::Map::new(), at(9, 1))
            .await
            .unwrap();

        let first = queue
            .claim("w1", Duration::minutes(10), at(9, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.entry.job_id, a);

        let second = queue
            .claim("w1", Duration::minutes(10), at(9, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.entry.job_id, b);
    }

    #[tokio::test]
    async fn delayed_entries_promote_only_when_due() {
        let queue = queue();
        let job = Uuid::new_v4();
        queue
            .enqueue_at(job, vec![], serde_json::Map::new(), at(12, 5))
            .await
            .unwrap();

        queue.promote(at(12, 4)).await.unwrap();
        assert!(queue
            .claim("w1", Duration::minutes(10), at(12, 4))
            .await
            .unwrap()
            .is_none());

        queue.promote(at(12, 5)).await.unwrap();
        let claimed = queue
            .claim("w1", Duration::minutes(10), at(12, 5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.entry.job_id, job);
    }

    #[tokio::test]
    async fn repeated_enqueue_at_same_fire_time_collapses() {
        let queue = queue();
        let job = Uuid::new_v4();

        queue
            .enqueue_at(job, vec![], serde_json::Map::new(), at(12, 5))
            .await
            .unwrap();
        queue
            .enqueue_at(job, vec![], serde_json::Map::new(), at(12, 5))
            .await
            .unwrap();

        assert_eq!(queue.promote(at(12, 6)).await.unwrap(), 1);
        let (fifo, delayed, _) = queue.depths().await.unwrap();
        assert_eq!((fifo, delayed), (1, 0));
    }

    #[tokio::test]
    async fn crash_after_claim_redelivers_after_lease_expiry() {
        let queue = queue();
        let job = Uuid::new_v4();
        queue
            .enqueue(job, vec![], serde_json::Map::new(), at(9, 0))
            .await
            .unwrap();

        // Worker claims and then "crashes" without ever acking.
        let claimed = queue
            .claim("w1", Duration::minutes(10), at(9, 0))
            .await
            .unwrap()
            .unwrap();

        // Before expiry nobody else can claim it.
        assert!(queue
            .claim("w2", Duration::minutes(10), at(9, 5))
            .await
            .unwrap()
            .is_none());

        // After expiry the sweep returns it to the FIFO.
        queue.promote(at(9, 11)).await.unwrap();
        let reclaimed = queue
            .claim("w2", Duration::minutes(10), at(9, 11))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.entry.entry_id, claimed.entry.entry_id);
    }

    #[tokio::test]
    async fn ack_removes_lease_and_entry() {
        let queue = queue();
        let job = Uuid::new_v4();
        queue
            .enqueue(job, vec![], serde_json::Map::new(), at(9, 0))
            .await
            .unwrap();

        let claimed = queue
            .claim("w1", Duration::minutes(10), at(9, 0))
            .await
            .unwrap()
            .unwrap();
        queue.ack("w1", &claimed).await.unwrap();

        // Nothing left to redeliver, even past lease expiry.
        queue.promote(at(9, 30)).await.unwrap();
        assert!(queue
            .claim("w2", Duration::minutes(10), at(9, 30))
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.depths().await.unwrap(), (0, 0, 0));
    }

    #[tokio::test]
    async fn ack_by_wrong_worker_is_rejected() {
        let queue = queue();
        queue
            .enqueue(Uuid::new_v4(), vec![], serde_json::Map::new(), at(9, 0))
            .await
            .unwrap();
        let claimed = queue
            .claim("w1", Duration::minutes(10), at(9, 0))
            .await
            .unwrap()
            .unwrap();

        let err = queue.ack("w2", &claimed).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseNotHeld { .. }));
    }

    #[tokio::test]
    async fn cancel_delayed_drops_only_that_job() {
        let queue = queue();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        queue
            .enqueue_at(keep, vec![], serde_json::Map::new(), at(12, 0))
            .await
            .unwrap();
        queue
            .enqueue_at(drop, vec![], serde_json::Map::new(), at(12, 0))
            .await
            .unwrap();

        assert_eq!(queue.cancel_delayed(drop).await.unwrap(), 1);
        assert_eq!(queue.promote(at(12, 1)).await.unwrap(), 1);
        let claimed = queue
            .claim("w1", Duration::minutes(10), at(12, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.entry.job_id, keep);
    }
}
