use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use vidpipe_rs::integration::{
    EventFilter, MemorySink, PipelineRunner, Stages, SyntheticFrameSource, TelemetryRecord,
    TelemetrySink, read_events,
};
use vidpipe_rs::jobs::{
    ArtifactRefs, InMemoryJobStore, JobFilter, PreparedRun, RateLimitConfig, RunnerFactory,
};
use vidpipe_rs::{
    Detection, DetectionSource, Frame, FrameSource, JobError, JobId, JobOrchestrator, JobParams,
    JobRecord, JobStatus, PipelineError, Settings, StageError, SystemClock, TrackerConfig, Zone,
};

/// Blocks frame delivery until opened.
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

struct GatedSource {
    inner: SyntheticFrameSource,
    gate: Option<Gate>,
}

impl FrameSource for GatedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, StageError> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.inner.next_frame()
    }

    fn len_hint(&self) -> Option<u64> {
        self.inner.len_hint()
    }
}

struct FailingDetector {
    at: u64,
}

impl DetectionSource for FailingDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, StageError> {
        if frame.index >= self.at {
            Err(StageError::Detector("inference backend crashed".into()))
        } else {
            Ok(vec![])
        }
    }
}

/// Holds the run inside `flush`, after every frame was processed.
struct GatedSink {
    inner: MemorySink,
    gate: Option<Gate>,
}

impl TelemetrySink for GatedSink {
    fn record(&mut self, record: TelemetryRecord) -> Result<(), PipelineError> {
        self.inner.record(record)
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.inner.flush()
    }
}

#[derive(Default)]
struct TestFactory {
    gate: Option<Gate>,
    flush_gate: Option<Gate>,
    fail_at: Option<u64>,
}

impl RunnerFactory for TestFactory {
    fn prepare(&self, job: &JobRecord) -> Result<PreparedRun, PipelineError> {
        let config = job.params.pipeline_config(TrackerConfig::default());
        let mut stages = Stages::mock();
        if let Some(at) = self.fail_at {
            stages.detector = Box::new(FailingDetector { at });
        }
        let source = GatedSource {
            inner: SyntheticFrameSource::new(160, 120, config.max_frames),
            gate: self.gate.clone(),
        };
        Ok(PreparedRun {
            runner: PipelineRunner::new(config, stages),
            source: Box::new(source),
            sink: Box::new(GatedSink {
                inner: MemorySink::new(),
                gate: self.flush_gate.clone(),
            }),
            artifacts: ArtifactRefs::default(),
        })
    }
}

fn settings(workers: usize, limit: u32) -> Settings {
    Settings {
        workers,
        rate_limit: RateLimitConfig {
            limit,
            window_secs: 60,
        },
        ..Default::default()
    }
}

fn orchestrator(settings: &Settings, factory: TestFactory) -> JobOrchestrator {
    orchestrator_with_store(settings, factory).0
}

fn orchestrator_with_store(
    settings: &Settings,
    factory: TestFactory,
) -> (JobOrchestrator, Arc<InMemoryJobStore>) {
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = JobOrchestrator::new(
        settings,
        store.clone(),
        Arc::new(factory),
        Arc::new(SystemClock),
    );
    (orchestrator, store)
}

fn params(max_frames: u32) -> JobParams {
    JobParams {
        max_frames,
        ..Default::default()
    }
}

async fn wait_for_status(orchestrator: &JobOrchestrator, id: JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while orchestrator.get(id).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never reached the expected status");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_queued_then_running_job() {
    let gate = Gate::default();
    let orchestrator = orchestrator(
        &settings(1, 30),
        TestFactory {
            gate: Some(gate.clone()),
            ..Default::default()
        },
    );

    let first = orchestrator.submit(params(100), "alice", None).await.unwrap().job.id;
    wait_for_status(&orchestrator, first, JobStatus::Running).await;

    // The only worker is busy, so this one stays queued.
    let second = orchestrator.submit(params(100), "alice", None).await.unwrap().job.id;
    assert_eq!(orchestrator.get(second).await.unwrap().status, JobStatus::Queued);

    let cancelled = orchestrator.cancel(second).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(orchestrator.get(second).await.unwrap().status, JobStatus::Cancelled);

    let flagged = orchestrator.cancel(first).await.unwrap();
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    gate.open();
    let done = orchestrator.wait(first).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    let summary = done.summary.unwrap();
    assert!(summary.stopped_early);
    assert!(summary.frames_processed < 100);

    assert!(matches!(
        orchestrator.cancel(first).await,
        Err(JobError::InvalidTransition {
            status: JobStatus::Cancelled,
            ..
        })
    ));
}

async fn wait_for_frames(orchestrator: &JobOrchestrator, id: JobId, frames: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while orchestrator.get(id).await.unwrap().progress.frames_processed < frames {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never processed the expected frames");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_accepted_after_last_frame_still_cancels() {
    let flush_gate = Gate::default();
    let orchestrator = orchestrator(
        &settings(1, 30),
        TestFactory {
            flush_gate: Some(flush_gate.clone()),
            ..Default::default()
        },
    );
    let id = orchestrator.submit(params(10), "alice", None).await.unwrap().job.id;
    wait_for_frames(&orchestrator, id, 10).await;

    let flagged = orchestrator.cancel(id).await.unwrap();
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    flush_gate.open();
    let done = orchestrator.wait(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.summary.unwrap().frames_processed, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_status_survives_store_outage() {
    let flush_gate = Gate::default();
    let (orchestrator, store) = orchestrator_with_store(
        &settings(1, 30),
        TestFactory {
            flush_gate: Some(flush_gate.clone()),
            ..Default::default()
        },
    );
    let id = orchestrator.submit(params(10), "alice", None).await.unwrap().job.id;
    wait_for_frames(&orchestrator, id, 10).await;

    store.set_available(false);
    flush_gate.open();
    tokio::time::sleep(Duration::from_millis(400)).await;
    // the outcome is still pending, not dropped
    assert_eq!(orchestrator.active_jobs(), 1);

    store.set_available(true);
    let done = tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(id))
        .await
        .expect("terminal write never landed")
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(orchestrator.active_jobs(), 0);
}

#[tokio::test]
async fn test_cancel_completed_job_is_invalid() {
    let orchestrator = orchestrator(&settings(2, 30), TestFactory::default());
    let id = orchestrator.submit(params(20), "alice", None).await.unwrap().job.id;

    let done = orchestrator.wait(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.frames_processed, 20);
    assert!(done.finished_at.is_some());

    let err = orchestrator.cancel(id).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition {
            status: JobStatus::Completed,
            action: "cancel",
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert!(matches!(
        orchestrator.retry(id).await,
        Err(JobError::InvalidTransition { action: "retry", .. })
    ));
}

#[tokio::test]
async fn test_stage_failure_fails_job_and_retry_links_lineage() {
    let orchestrator = orchestrator(
        &settings(2, 30),
        TestFactory {
            fail_at: Some(3),
            ..Default::default()
        },
    );
    let id = orchestrator.submit(params(50), "bob", None).await.unwrap().job.id;

    let failed = orchestrator.wait(id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let message = failed.error.unwrap();
    assert!(message.contains("frame 3"), "{message}");

    let retried = orchestrator.retry(id).await.unwrap();
    assert_ne!(retried.id, id);
    assert_eq!(retried.retry_of, Some(id));
    assert_eq!(retried.requested_by, "bob");
    assert_eq!(retried.params, failed.params);
    assert_eq!(
        orchestrator.wait(retried.id).await.unwrap().status,
        JobStatus::Failed
    );

    let metrics = orchestrator.metrics().await.unwrap();
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.by_status[&JobStatus::Failed], 2);
}

#[tokio::test]
async fn test_idempotency_key_returns_same_job() {
    let orchestrator = orchestrator(&settings(2, 30), TestFactory::default());

    let first = orchestrator.submit(params(10), "alice", Some("upload-1")).await.unwrap();
    let again = orchestrator.submit(params(10), "alice", Some("upload-1")).await.unwrap();
    assert!(!first.replayed);
    assert!(again.replayed);
    assert_eq!(first.job.id, again.job.id);

    let other_key = orchestrator.submit(params(10), "alice", Some("upload-2")).await.unwrap();
    let no_key = orchestrator.submit(params(10), "alice", None).await.unwrap();
    assert_ne!(other_key.job.id, first.job.id);
    assert_ne!(no_key.job.id, first.job.id);

    let page = orchestrator.list(&JobFilter::default()).await.unwrap();
    assert_eq!(page.total, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_with_one_key_create_one_job() {
    let orchestrator = orchestrator(&settings(2, 100), TestFactory::default());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit(params(10), "alice", Some("same"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut submissions = Vec::new();
    for handle in handles {
        submissions.push(handle.await.unwrap());
    }
    let id = submissions[0].job.id;
    assert!(submissions.iter().all(|s| s.job.id == id));
    assert_eq!(submissions.iter().filter(|s| !s.replayed).count(), 1);
    assert_eq!(orchestrator.list(&JobFilter::default()).await.unwrap().total, 1);
}

#[tokio::test]
async fn test_rate_limit_rejects_only_the_excess() {
    let orchestrator = orchestrator(&settings(2, 3), TestFactory::default());

    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..5 {
        match orchestrator.submit(params(10), "cam-1", None).await {
            Ok(_) => accepted += 1,
            Err(JobError::RateLimitExceeded { caller_id, limit, .. }) => {
                assert_eq!(caller_id, "cam-1");
                assert_eq!(limit, 3);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((accepted, rejected), (3, 2));

    assert!(orchestrator.submit(params(10), "cam-2", None).await.is_ok());

    let page = orchestrator
        .list(&JobFilter {
            requested_by: Some("cam-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 3);
}

#[tokio::test]
async fn test_invalid_zone_is_rejected_before_creation() {
    let orchestrator = orchestrator(&settings(1, 30), TestFactory::default());
    let bad = JobParams {
        zones: vec![
            Zone::rect("gate", 0.0, 0.0, 10.0, 10.0),
            Zone::rect("gate", 20.0, 20.0, 30.0, 30.0),
        ],
        ..params(10)
    };
    assert!(matches!(
        orchestrator.submit(bad, "alice", None).await,
        Err(JobError::Validation(_))
    ));
    assert_eq!(orchestrator.list(&JobFilter::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_default_orchestrator_writes_analytics_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        runtime_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let orchestrator = JobOrchestrator::with_defaults(&settings);

    let job = JobParams {
        zones: vec![Zone::rect("court", 0.0, 0.0, 640.0, 360.0)],
        ..params(40)
    };
    let id = orchestrator.submit(job, "alice", None).await.unwrap().job.id;
    let done = orchestrator.wait(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    let path = done.artifacts.analytics_path.unwrap();
    assert_eq!(path, settings.outputs_dir().join(format!("{id}.jsonl")));
    let events = read_events(&path, &EventFilter::default()).unwrap();
    assert_eq!(events.len() as u64, done.summary.unwrap().events_detected);
    assert!(!events.is_empty());
}
