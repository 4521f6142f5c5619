/// Configuration management for the Runloom engine
///
/// Handles server, database, queue, worker and engine parameters.
/// Every value can be overridden through a RUNLOOM_* environment variable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Durable job queue policy
    pub queue: QueueConfig,
    /// Worker pool sizing
    pub worker: WorkerConfig,
    /// Execution engine behavior
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding the database file (default: "data")
    pub data_dir: String,
    /// Database file name inside `data_dir` (default: "runloom.db")
    pub file_name: String,
}

/// Job queue options
///
/// Mirrors the options a Bull-style queue recognizes: retry attempts with exponential
/// backoff, retention of finished jobs, a hard per-job timeout and heartbeat-based
/// stall detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Total delivery attempts per job (first run included)
    pub attempts: u32,
    /// Base delay of the exponential backoff between attempts
    pub backoff_ms: u64,
    /// Keep this many most recent completed jobs; None keeps all
    pub remove_on_complete: Option<u32>,
    /// Keep this many most recent failed jobs; None keeps all
    pub remove_on_fail: Option<u32>,
    /// Hard wall clock per job
    pub job_timeout_ms: u64,
    /// Heartbeat age after which an active job counts as stalled
    pub stalled_interval_ms: u64,
    /// Number of stalls tolerated before the job is failed
    pub max_stalled_count: u32,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent consumer loops
    pub concurrency: usize,
    /// Fallback polling interval when no enqueue notification arrives
    pub poll_interval_ms: u64,
}

/// What to do with workflow graphs that contain a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Fail the run before any node executes
    Reject,
    /// Best-effort ordering; the visited set breaks the cycle
    Tolerate,
}

/// Execution engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied by the HTTP request handler
    pub http_timeout_ms: u64,
    /// Cycle handling policy
    pub cycle_policy: CyclePolicy,
    /// Check run status for cancellation before each node dispatch
    pub cancellation_checks: bool,
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }
}

/// Source of raw configuration values, keyed by environment variable name
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl QueueConfig {
    fn from_lookup(lookup: Lookup<'_>) -> Self {
        Self {
            attempts: parse_or(lookup, "RUNLOOM_QUEUE_ATTEMPTS", 3),
            backoff_ms: parse_or(lookup, "RUNLOOM_QUEUE_BACKOFF_MS", 2000),
            remove_on_complete: parse_opt(lookup, "RUNLOOM_QUEUE_REMOVE_ON_COMPLETE").or(Some(100)),
            remove_on_fail: parse_opt(lookup, "RUNLOOM_QUEUE_REMOVE_ON_FAIL"),
            job_timeout_ms: parse_or(lookup, "RUNLOOM_JOB_TIMEOUT_MS", 300_000),
            stalled_interval_ms: parse_or(lookup, "RUNLOOM_STALLED_INTERVAL_MS", 30_000),
            max_stalled_count: parse_or(lookup, "RUNLOOM_MAX_STALLED_COUNT", 2),
        }
    }
}

impl WorkerConfig {
    fn from_lookup(lookup: Lookup<'_>) -> Self {
        Self {
            concurrency: parse_or(lookup, "RUNLOOM_WORKER_CONCURRENCY", 1),
            poll_interval_ms: parse_or(lookup, "RUNLOOM_POLL_INTERVAL_MS", 1000),
        }
    }
}

impl EngineConfig {
    fn from_lookup(lookup: Lookup<'_>) -> Self {
        let cycle_policy = match lookup("RUNLOOM_CYCLE_POLICY").as_deref() {
            Some("tolerate") => CyclePolicy::Tolerate,
            _ => CyclePolicy::Reject,
        };

        Self {
            http_timeout_ms: parse_or(lookup, "RUNLOOM_HTTP_TIMEOUT_MS", 30_000),
            cycle_policy,
            cancellation_checks: parse_or(lookup, "RUNLOOM_CANCEL_CHECKS", true),
        }
    }
}

impl Config {
    fn from_lookup(lookup: Lookup<'_>) -> Self {
        Self {
            server: ServerConfig {
                host: lookup("RUNLOOM_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or(lookup, "RUNLOOM_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: lookup("RUNLOOM_DATA_DIR").unwrap_or_else(|| "data".to_string()),
                file_name: lookup("RUNLOOM_DB_FILE").unwrap_or_else(|| "runloom.db".to_string()),
            },
            queue: QueueConfig::from_lookup(lookup),
            worker: WorkerConfig::from_lookup(lookup),
            engine: EngineConfig::from_lookup(lookup),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_lookup(&process_env)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(&process_env)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(&process_env)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self::from_lookup(&process_env)
    }
}

/// Parse a configuration value, falling back to `default` when unset or malformed
fn parse_or<T: std::str::FromStr>(lookup: Lookup<'_>, key: &str, default: T) -> T {
    parse_opt(lookup, key).unwrap_or(default)
}

fn parse_opt<T: std::str::FromStr>(lookup: Lookup<'_>, key: &str) -> Option<T> {
    lookup(key).and_then(|raw| raw.parse().ok())
}
