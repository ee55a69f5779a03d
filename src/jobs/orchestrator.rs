//! Accepts submissions and drives each job to exactly one terminal status.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::{JobError, JobResult};
use crate::jobs::factory::{MockRunnerFactory, PreparedRun, RunnerFactory};
use crate::jobs::idempotency::{Claim, IdempotencyGuard};
use crate::jobs::rate_limit::RateLimiter;
use crate::jobs::record::{JobId, JobParams, JobRecord, JobStatus, JobUpdate};
use crate::jobs::store::{InMemoryJobStore, JobFilter, JobMetrics, JobPage, JobStore, UpdateOutcome};

const FINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);
const FINAL_WRITE_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Result of `submit`. `replayed` is set when an idempotency key matched an
/// existing job and nothing new was created.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job: JobRecord,
    pub replayed: bool,
}

struct JobSignal {
    cancel: CancellationToken,
    status: watch::Sender<JobStatus>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    factory: Arc<dyn RunnerFactory>,
    limiter: RateLimiter,
    guard: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    /// Jobs not yet terminal
    signals: DashMap<JobId, JobSignal>,
}

/// Cheap to clone; clones share the same worker pool and tables.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn JobStore>,
        factory: Arc<dyn RunnerFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                limiter: RateLimiter::new(settings.rate_limit, clock.clone()),
                guard: IdempotencyGuard::new(settings.idempotency_ttl(), clock.clone()),
                clock,
                workers: Arc::new(Semaphore::new(settings.workers.max(1))),
                signals: DashMap::new(),
            }),
        }
    }

    /// In-memory store, mock stages writing to `Settings::outputs_dir`, and
    /// the system clock.
    pub fn with_defaults(settings: &Settings) -> Self {
        let factory = MockRunnerFactory::new(Some(settings.outputs_dir()), settings.tracker.clone());
        Self::new(
            settings,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(factory),
            Arc::new(SystemClock),
        )
    }

    /// Validate, rate-limit and deduplicate a request, then queue it.
    ///
    /// Returns as soon as the `queued` record is persisted.
    #[instrument(skip(self, params))]
    pub async fn submit(
        &self,
        params: JobParams,
        caller_id: &str,
        idempotency_key: Option<&str>,
    ) -> JobResult<Submission> {
        self.ensure_open()?;
        let params = params.validate()?;
        self.inner.limiter.check(caller_id)?;

        let store = self.inner.store.clone();
        let now = self.inner.clock.now();
        let claim = self
            .inner
            .guard
            .claim(caller_id, idempotency_key, move || async move {
                let record = JobRecord::new(
                    params,
                    caller_id,
                    idempotency_key.map(str::to_string),
                    now,
                );
                store.insert(record.clone()).await?;
                Ok(record)
            })
            .await?;

        match claim {
            Claim::Existing(id) => {
                let job = self.get(id).await?;
                info!(job_id = %id, "returning existing job for idempotency key");
                Ok(Submission {
                    job,
                    replayed: true,
                })
            }
            Claim::Created(job) => {
                info!(job_id = %job.id, "job queued");
                self.schedule(job.id);
                Ok(Submission {
                    job,
                    replayed: false,
                })
            }
        }
    }

    /// Cancel a `queued` job immediately, or flag a `running` one for the
    /// runner to stop at its next frame boundary. Once accepted, the job ends
    /// `cancelled` even if its run finishes first.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn cancel(&self, id: JobId) -> JobResult<JobRecord> {
        let current = self.get(id).await?;
        if !current.status.can_cancel() {
            return Err(invalid(&current, "cancel"));
        }

        let now = self.inner.clock.now();
        if current.status == JobStatus::Queued {
            if let UpdateOutcome::Applied(record) =
                self.inner.store.update(id, JobUpdate::Withdraw, now).await?
            {
                warn!("queued job cancelled");
                self.inner.notify(id, JobStatus::Cancelled);
                return Ok(record);
            }
        }

        // Started (or finished) since the first read.
        match self.inner.store.update(id, JobUpdate::RequestCancel, now).await? {
            UpdateOutcome::Applied(record) => {
                if let Some(signal) = self.inner.signals.get(&id) {
                    signal.cancel.cancel();
                }
                warn!("cancellation requested");
                Ok(record)
            }
            UpdateOutcome::Rejected(record) => Err(invalid(&record, "cancel")),
        }
    }

    /// Queue a fresh job with the same parameters as a failed or cancelled
    /// one. The new record points back at the original.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn retry(&self, id: JobId) -> JobResult<JobRecord> {
        self.ensure_open()?;
        let original = self.get(id).await?;
        if !original.status.can_retry() {
            return Err(invalid(&original, "retry"));
        }

        let mut record = JobRecord::new(
            original.params,
            original.requested_by,
            None,
            self.inner.clock.now(),
        );
        record.retry_of = Some(id);
        self.inner.store.insert(record.clone()).await?;

        info!(new_job_id = %record.id, "job retried");
        self.schedule(record.id);
        Ok(record)
    }

    pub async fn get(&self, id: JobId) -> JobResult<JobRecord> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    pub async fn list(&self, filter: &JobFilter) -> JobResult<JobPage> {
        Ok(self.inner.store.list(filter).await?)
    }

    pub async fn metrics(&self) -> JobResult<JobMetrics> {
        Ok(self.inner.store.metrics().await?)
    }

    /// Wait until the job reaches a terminal status and return it.
    pub async fn wait(&self, id: JobId) -> JobResult<JobRecord> {
        let receiver = self.inner.signals.get(&id).map(|s| s.status.subscribe());
        if let Some(mut receiver) = receiver {
            // A dropped sender means the job finished; the store has the outcome.
            let _ = receiver.wait_for(|status| status.is_terminal()).await;
        }
        self.get(id).await
    }

    /// Jobs queued or running in this process.
    pub fn active_jobs(&self) -> usize {
        self.inner.signals.len()
    }

    /// Stop accepting work: cancel every active job and close the pool.
    pub fn shutdown(&self) {
        self.inner.workers.close();
        for signal in self.inner.signals.iter() {
            signal.cancel.cancel();
        }
    }

    fn ensure_open(&self) -> JobResult<()> {
        if self.inner.workers.is_closed() {
            return Err(JobError::Shutdown);
        }
        Ok(())
    }

    fn schedule(&self, id: JobId) {
        let cancel = CancellationToken::new();
        let (status, _) = watch::channel(JobStatus::Queued);
        self.inner.signals.insert(
            id,
            JobSignal {
                cancel: cancel.clone(),
                status,
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.execute(id, cancel).await });
    }
}

impl Inner {
    async fn execute(self: Arc<Self>, id: JobId, cancel: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(job_id = %id, "cancelled before a worker was free");
                self.finish(id, JobUpdate::Cancel { summary: None }).await;
                return;
            }
            permit = self.workers.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            self.finish(
                id,
                JobUpdate::Fail {
                    error: JobError::Shutdown.to_string(),
                    summary: None,
                },
            )
            .await;
            return;
        };

        match self.run_job(id, &cancel).await {
            Ok(Some(update)) => self.finish(id, update).await,
            Ok(None) => self.notify_current(id).await,
            Err(e) => {
                error!(job_id = %id, error = %e, "job could not start");
                self.finish(
                    id,
                    JobUpdate::Fail {
                        error: e.to_string(),
                        summary: None,
                    },
                )
                .await;
            }
        }
    }

    /// Run the pipeline. `Ok(None)` means the job left `queued` before it
    /// could start.
    async fn run_job(
        &self,
        id: JobId,
        cancel: &CancellationToken,
    ) -> JobResult<Option<JobUpdate>> {
        let job = self.store.get(id).await?.ok_or(JobError::NotFound(id))?;
        let prepared = match self.factory.prepare(&job) {
            Ok(prepared) => prepared,
            Err(e) => {
                return Ok(Some(JobUpdate::Fail {
                    error: e.to_string(),
                    summary: None,
                }));
            }
        };

        let start = JobUpdate::Start {
            artifacts: prepared.artifacts.clone(),
        };
        if !self.store.update(id, start, self.clock.now()).await?.is_applied() {
            return Ok(None);
        }
        self.notify(id, JobStatus::Running);
        info!(job_id = %id, "job running");

        let (progress_tx, mut progress_rx) = watch::channel(job.progress);
        let forwarder = {
            let store = self.store.clone();
            let clock = self.clock.clone();
            tokio::spawn(async move {
                while progress_rx.changed().await.is_ok() {
                    let progress = *progress_rx.borrow_and_update();
                    if let Err(e) = store.update(id, JobUpdate::Progress(progress), clock.now()).await {
                        debug!(job_id = %id, error = %e, "progress update dropped");
                    }
                }
            })
        };

        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            let PreparedRun {
                mut runner,
                mut source,
                mut sink,
                ..
            } = prepared;
            runner.run(source.as_mut(), sink.as_mut(), &token, &mut |progress| {
                progress_tx.send_replace(progress);
            })
        })
        .await;
        let _ = forwarder.await;

        let update = match result {
            Ok(Ok(summary)) if summary.stopped_early || cancel.is_cancelled() => {
                warn!(job_id = %id, frames = summary.frames_processed, "job cancelled by request");
                JobUpdate::Cancel {
                    summary: Some(summary),
                }
            }
            Ok(Ok(summary)) => {
                info!(
                    job_id = %id,
                    frames = summary.frames_processed,
                    events = summary.events_detected,
                    "job completed"
                );
                JobUpdate::Complete { summary }
            }
            Ok(Err(e)) => {
                warn!(job_id = %id, error = %e, "job failed");
                JobUpdate::Fail {
                    error: e.to_string(),
                    summary: None,
                }
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "pipeline worker panicked");
                JobUpdate::Fail {
                    error: format!("pipeline worker panicked: {e}"),
                    summary: None,
                }
            }
        };
        Ok(Some(update))
    }

    /// Persist a terminal update, then wake waiters.
    ///
    /// The outcome is held here until the store accepts it; the job's signal
    /// stays registered meanwhile, so `wait` keeps blocking.
    async fn finish(&self, id: JobId, update: JobUpdate) {
        let mut attempt: u32 = 0;
        loop {
            match self.store.update(id, update.clone(), self.clock.now()).await {
                Ok(outcome) => {
                    if attempt > 0 {
                        info!(job_id = %id, attempt, "terminal state persisted after retry");
                    }
                    self.notify(id, outcome.record().status);
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let backoff = FINAL_WRITE_BACKOFF
                        .saturating_mul(attempt)
                        .min(FINAL_WRITE_BACKOFF_MAX);
                    if attempt % 10 == 1 {
                        warn!(job_id = %id, error = %e, attempt, "terminal write failed, retrying");
                    } else {
                        debug!(job_id = %id, error = %e, attempt, "terminal write failed, retrying");
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn notify_current(&self, id: JobId) {
        match self.store.get(id).await {
            Ok(Some(record)) => self.notify(id, record.status),
            _ => {
                self.signals.remove(&id);
            }
        }
    }

    /// Publish a status change; terminal statuses retire the job's signal.
    fn notify(&self, id: JobId, status: JobStatus) {
        if status.is_terminal() {
            if let Some((_, signal)) = self.signals.remove(&id) {
                signal.cancel.cancel();
                signal.status.send_replace(status);
            }
        } else if let Some(signal) = self.signals.get(&id) {
            signal.status.send_replace(status);
        }
    }
}

fn invalid(record: &JobRecord, action: &'static str) -> JobError {
    JobError::InvalidTransition {
        job_id: record.id,
        status: record.status,
        action,
    }
}
