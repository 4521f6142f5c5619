/// Run records and usage metering
///
/// The persistent side of an execution: the run record the worker transitions
/// through its state machine, and the usage counters notified on success.

pub mod storage;
pub mod types;
pub mod usage;

pub use storage::{RunStore, SqliteRunStore};
pub use types::{CancelOutcome, Run, RunFailure, RunFilter, RunStatus, RunSuccess};
pub use usage::{SqliteUsageLedger, UsageMetric, UsageRecord, UsageSink};
