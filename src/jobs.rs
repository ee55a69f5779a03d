//! Job orchestration: records, persistence, admission control and execution.

mod factory;
mod idempotency;
mod orchestrator;
mod rate_limit;
mod record;
mod store;

pub use factory::{MockRunnerFactory, PreparedRun, RunnerFactory};
pub use idempotency::{Claim, IdempotencyGuard, IdempotencyRecord};
pub use orchestrator::{JobOrchestrator, Submission};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateWindowCounter};
pub use record::{ArtifactRefs, JobId, JobParams, JobRecord, JobStatus, JobUpdate};
pub use store::{
    DEFAULT_PAGE_SIZE, InMemoryJobStore, JobFilter, JobMetrics, JobPage, JobStore, MAX_PAGE_SIZE,
    UpdateOutcome,
};
