//! Persistence contract for job records and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::jobs::record::{JobId, JobRecord, JobStatus, JobUpdate};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub requested_by: Option<String>,
    /// Page size, defaults to 20 and is capped at 100
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self
                .requested_by
                .as_deref()
                .is_none_or(|caller| caller == record.requested_by)
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of records, newest first, plus the unpaged match count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<JobRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub total: usize,
    pub by_status: BTreeMap<JobStatus, usize>,
    /// Mean wall time of finished jobs
    pub average_duration_secs: Option<f64>,
    pub average_processing_fps: Option<f64>,
}

impl JobMetrics {
    /// Aggregate over any set of records.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut metrics = JobMetrics {
            by_status: JobStatus::ALL.iter().map(|s| (*s, 0)).collect(),
            ..Default::default()
        };
        let (mut durations, mut fps) = (Vec::new(), Vec::new());

        for record in records {
            metrics.total += 1;
            *metrics.by_status.entry(record.status).or_default() += 1;
            if let Some(duration) = record.duration() {
                durations.push(duration.num_milliseconds() as f64 / 1000.0);
            }
            if let Some(summary) = &record.summary {
                if summary.frames_processed > 0 {
                    fps.push(summary.average_processing_fps);
                }
            }
        }

        let mean = |v: &[f64]| (!v.is_empty()).then(|| v.iter().sum::<f64>() / v.len() as f64);
        metrics.average_duration_secs = mean(&durations);
        metrics.average_processing_fps = mean(&fps);
        metrics
    }
}

/// Outcome of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(JobRecord),
    /// Current status does not allow the update; carries the unchanged record
    Rejected(JobRecord),
}

impl UpdateOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            UpdateOutcome::Applied(r) | UpdateOutcome::Rejected(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// CRUD, filtered listing and metrics over job records.
///
/// `update` must be atomic per record: the status check and the write happen
/// without any other writer to the same job in between.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    async fn update(
        &self,
        id: JobId,
        update: JobUpdate,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, StoreError>;

    async fn metrics(&self) -> Result<JobMetrics, StoreError>;
}

/// `DashMap`-backed store. Writes hold the per-entry lock.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, JobRecord>,
    available: AtomicBool,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self {
            jobs: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        self.check()?;
        match self.jobs.entry(record.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check()?;
        Ok(self.jobs.get(&id).map(|r| r.value().clone()))
    }

    async fn update(
        &self,
        id: JobId,
        update: JobUpdate,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check()?;
        let mut entry = self.jobs.get_mut(&id).ok_or(StoreError::Missing(id))?;
        let record = entry.value_mut();
        if update.apply_to(record, at) {
            Ok(UpdateOutcome::Applied(record.clone()))
        } else {
            Ok(UpdateOutcome::Rejected(record.clone()))
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage, StoreError> {
        self.check()?;
        let mut matching: Vec<JobRecord> = self
            .jobs
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.page_size())
            .collect();
        Ok(JobPage { items, total })
    }

    async fn metrics(&self) -> Result<JobMetrics, StoreError> {
        self.check()?;
        let records: Vec<JobRecord> = self.jobs.iter().map(|r| r.value().clone()).collect();
        Ok(JobMetrics::from_records(&records))
    }
}
