//! Deduplication of job submissions by caller-supplied key.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::error::JobError;
use crate::jobs::record::{JobId, JobRecord};

/// Expired records are swept once every this many keyed claims.
const PURGE_EVERY: u64 = 64;

type Slot = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub job_id: JobId,
    pub expires_at: DateTime<Utc>,
}

/// Result of a guarded submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// A live record already maps the key to this job
    Existing(JobId),
    Created(JobRecord),
}

/// Keys are scoped per caller. Each `(caller, key)` slot has its own lock,
/// held across lookup, job creation and record insertion, so one key yields
/// at most one job while unrelated keys proceed in parallel.
pub struct IdempotencyGuard {
    ttl: Duration,
    records: DashMap<Slot, IdempotencyRecord>,
    locks: DashMap<Slot, Arc<Mutex<()>>>,
    claims: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
            locks: DashMap::new(),
            claims: AtomicU64::new(0),
            clock,
        }
    }

    /// Return the job already bound to `key`, or run `create` and bind its
    /// result. Without a key `create` always runs. When `create` fails no
    /// record is written.
    pub async fn claim<F, Fut>(
        &self,
        caller_id: &str,
        key: Option<&str>,
        create: F,
    ) -> Result<Claim, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobRecord, JobError>>,
    {
        let Some(key) = key else {
            return create().await.map(Claim::Created);
        };

        if self.claims.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }

        let slot: Slot = (caller_id.to_string(), key.to_string());
        let lock = self.locks.entry(slot.clone()).or_default().clone();
        let result = {
            let _held = lock.lock().await;
            self.claim_locked(&slot, create).await
        };

        // Retire the slot lock unless another claimant is queued on it.
        drop(lock);
        self.locks.remove_if(&slot, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn claim_locked<F, Fut>(&self, slot: &Slot, create: F) -> Result<Claim, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobRecord, JobError>>,
    {
        let now = self.clock.now();
        if let Some(existing) = self.records.get(slot) {
            if existing.expires_at > now {
                debug!(caller_id = %slot.0, key = %slot.1, job_id = %existing.job_id, "idempotent replay");
                return Ok(Claim::Existing(existing.job_id));
            }
        }

        let record = create().await?;
        self.records.insert(
            slot.clone(),
            IdempotencyRecord {
                key: slot.1.clone(),
                job_id: record.id,
                expires_at: now + self.ttl,
            },
        );
        Ok(Claim::Created(record))
    }

    pub fn lookup(&self, caller_id: &str, key: &str) -> Option<IdempotencyRecord> {
        let now = self.clock.now();
        self.records
            .get(&(caller_id.to_string(), key.to_string()))
            .filter(|r| r.expires_at > now)
            .map(|r| r.value().clone())
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, r| r.expires_at > now);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "purged expired idempotency keys");
        }
        removed
    }

    /// Records currently held, live or expired.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
