/// Durable run queue
///
/// Decouples run creation from execution. The API enqueues one job per run and the
/// worker pool consumes them with retries, backoff and stall recovery.

pub mod jobs;

pub use jobs::{FailOutcome, Job, JobCounts, JobQueue, JobState, StallReport};
