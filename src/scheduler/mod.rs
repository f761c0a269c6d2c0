// ============================================================================
// Scheduler - delayed jobs, dedup, retries, worker pool
// ============================================================================

mod job;
mod queue;
mod worker;

pub use job::{Backoff, Job, JobOptions, JobProcessor, Retention};
pub use queue::{AddOutcome, JobCounts, JobQueue};
pub use worker::{Worker, WorkerConfig};
