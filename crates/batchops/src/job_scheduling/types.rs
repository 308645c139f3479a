//! Wire types shared by the queue, the schedule registry and the workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// One unit of work sitting in the queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// Unique per queue entry; the lease is keyed on it
    pub entry_id: Uuid,
    /// The job definition this entry executes
    pub job_id: Uuid,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        job_id: Uuid,
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            job_id,
            args,
            kwargs,
            enqueued_at,
        }
    }

    /// Stable discriminator for delayed-set deduplication
    ///
    /// Delayed keys embed (job, fire time, args hash) so re-inserting the
    /// same scheduled fire lands on the same key, while retries for
    /// different payloads stay distinct.
    pub fn args_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        serde_json::Value::Array(self.args.clone()).to_string().hash(&mut hasher);
        serde_json::Value::Object(self.kwargs.clone()).to_string().hash(&mut hasher);
        hasher.finish()
    }
}

/// Lease held by a worker on a claimed entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
    /// The FIFO key the entry was claimed from; used by the expiry sweep
    /// to tell "claim half-finished" apart from "worker died mid-run"
    pub fifo_key: String,
    pub entry: QueueEntry,
}

/// An entry handed to a worker together with its lease handle
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub entry: QueueEntry,
    pub worker_id: String,
    pub lease_key: String,
}

/// Durable per-job schedule registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub cron: String,
    pub next_fire: DateTime<Utc>,
    /// The most recent fire time whose enqueue was recorded
    pub last_dispatched: Option<DateTime<Utc>>,
}
