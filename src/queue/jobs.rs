/// Durable job queue on SQLite
///
/// One job per run. Jobs move `waiting -> active -> completed | failed`, with failed
/// attempts going back to `waiting` after an exponential backoff until attempts run
/// out. Active jobs prove liveness through heartbeats; jobs whose heartbeat goes
/// quiet are recovered by the stall sweeper.

use crate::config::QueueConfig;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{sqlite::{SqlitePool, SqliteRow}, Row};
use std::{sync::Arc, time::Duration};
use tokio::sync::Notify;
use uuid::Uuid;

/// Failure message recorded on jobs that stalled too often
pub const STALLED_LIMIT_MESSAGE: &str = "job stalled more than allowable limit";

/// Failure message recorded on waiting jobs whose run was cancelled
pub const RUN_CANCELLED_MESSAGE: &str = "run cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(anyhow::anyhow!("Unknown job state: {}", other)),
        }
    }
}

/// A queued unit of work: "process this run"
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: i64,
    pub run_id: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds before which the job is not handed out
    pub available_at: i64,
    #[serde(skip)]
    pub lock_token: Option<String>,
    pub locked_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub stalled_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// What `fail` did with the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to waiting, available again after `delay`
    Retrying { delay: Duration },
    /// Attempts exhausted
    Failed,
    /// The caller no longer held the job
    LockLost,
}

/// Result of one stall sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Job counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

const JOB_COLUMNS: &str = "id, run_id, state, attempts_made, max_attempts, available_at, lock_token, \
    locked_at, heartbeat_at, stalled_count, last_error, created_at, finished_at";

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state")?;
    let attempts_made: i64 = row.try_get("attempts_made")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let stalled_count: i64 = row.try_get("stalled_count")?;

    Ok(Job {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        state: JobState::parse(&state)?,
        attempts_made: attempts_made.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        available_at: row.try_get("available_at")?,
        lock_token: row.try_get("lock_token")?,
        locked_at: row.try_get("locked_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        stalled_count: stalled_count.max(0) as u32,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Delay before attempt `attempts_made + 1`: `backoff * 2^(attempts_made - 1)`
pub fn backoff_delay(backoff_ms: u64, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(32);
    Duration::from_millis(backoff_ms.saturating_mul(1u64 << exponent))
}

/// SQLite-backed queue shared by the API (producer) and the worker pool (consumers)
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a job for `run_id` and wake one idle consumer
    pub async fn enqueue(&self, run_id: &str) -> Result<i64> {
        let now = now_ms();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (run_id, state, attempts_made, max_attempts, available_at, stalled_count, created_at)
            VALUES (?, 'waiting', 0, ?, ?, 0, ?)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(i64::from(self.config.attempts.max(1)))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!("📥 Enqueued job {} for run {}", id, run_id);
        self.notify.notify_one();

        Ok(id)
    }

    /// Wait until a job is enqueued or `timeout` elapses
    pub async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Atomically take the oldest available waiting job
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let now = now_ms();
        let token = Uuid::new_v4().to_string();

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'active', lock_token = ?, locked_at = ?, heartbeat_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'waiting' AND available_at <= ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&token)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            tracing::debug!("🔒 Claimed job {} (run {}, attempt {})", job.id, job.run_id, job.attempts_made + 1);
        }
        Ok(job)
    }

    /// Refresh the liveness timestamp; false when the job was taken away
    pub async fn heartbeat(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND state = 'active' AND lock_token = ?",
        )
        .bind(now_ms())
        .bind(job.id)
        .bind(&job.lock_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a claimed job completed and apply completed-job retention
    pub async fn complete(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', finished_at = ?, lock_token = NULL
            WHERE id = ? AND state = 'active' AND lock_token = ?
            "#,
        )
        .bind(now_ms())
        .bind(job.id)
        .bind(&job.lock_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!("⚠️ Job {} was no longer held when completing", job.id);
            return Ok(false);
        }

        if let Some(keep) = self.config.remove_on_complete {
            self.prune(JobState::Completed, keep).await?;
        }
        Ok(true)
    }

    /// Record a failed attempt; retries with backoff while attempts remain
    pub async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome> {
        let attempts_made = job.attempts_made + 1;
        let now = now_ms();

        if attempts_made < job.max_attempts {
            let delay = backoff_delay(self.config.backoff_ms, attempts_made);
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'waiting', attempts_made = ?, available_at = ?, last_error = ?,
                    lock_token = NULL, locked_at = NULL, heartbeat_at = NULL
                WHERE id = ? AND state = 'active' AND lock_token = ?
                "#,
            )
            .bind(i64::from(attempts_made))
            .bind(now.saturating_add(delay.as_millis() as i64))
            .bind(error)
            .bind(job.id)
            .bind(&job.lock_token)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Ok(FailOutcome::LockLost);
            }

            tracing::warn!(
                "🔁 Job {} failed (attempt {}/{}), retrying in {:?}: {}",
                job.id, attempts_made, job.max_attempts, delay, error
            );
            return Ok(FailOutcome::Retrying { delay });
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', attempts_made = ?, last_error = ?, finished_at = ?, lock_token = NULL
            WHERE id = ? AND state = 'active' AND lock_token = ?
            "#,
        )
        .bind(i64::from(attempts_made))
        .bind(error)
        .bind(now)
        .bind(job.id)
        .bind(&job.lock_token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(FailOutcome::LockLost);
        }

        tracing::error!("💀 Job {} failed permanently after {} attempts: {}", job.id, attempts_made, error);

        if let Some(keep) = self.config.remove_on_fail {
            self.prune(JobState::Failed, keep).await?;
        }
        Ok(FailOutcome::Failed)
    }

    /// Requeue or fail active jobs whose heartbeat is older than the stall interval
    pub async fn recover_stalled(&self) -> Result<StallReport> {
        let now = now_ms();
        let cutoff = now - self.config.stalled_interval_ms as i64;
        let mut report = StallReport::default();

        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE state = 'active' AND COALESCE(heartbeat_at, locked_at, 0) < ? ORDER BY id",
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let job = job_from_row(row)?;
            let stalled_count = job.stalled_count + 1;

            if stalled_count > self.config.max_stalled_count {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed', stalled_count = ?, last_error = ?, finished_at = ?, lock_token = NULL
                    WHERE id = ? AND state = 'active' AND lock_token IS ?
                    "#,
                )
                .bind(i64::from(stalled_count))
                .bind(STALLED_LIMIT_MESSAGE)
                .bind(now)
                .bind(job.id)
                .bind(&job.lock_token)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() > 0 {
                    tracing::error!("💀 Job {} (run {}) {}", job.id, job.run_id, STALLED_LIMIT_MESSAGE);
                    report.failed.push(job.id);
                }
            } else {
                let result = sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'waiting', stalled_count = ?, available_at = ?,
                        lock_token = NULL, locked_at = NULL, heartbeat_at = NULL
                    WHERE id = ? AND state = 'active' AND lock_token IS ?
                    "#,
                )
                .bind(i64::from(stalled_count))
                .bind(now)
                .bind(job.id)
                .bind(&job.lock_token)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() > 0 {
                    tracing::warn!("🧟 Job {} (run {}) stalled, returned to waiting", job.id, job.run_id);
                    report.requeued.push(job.id);
                }
            }
        }

        if !report.failed.is_empty() {
            if let Some(keep) = self.config.remove_on_fail {
                self.prune(JobState::Failed, keep).await?;
            }
        }
        if !report.requeued.is_empty() {
            self.notify.notify_one();
        }

        Ok(report)
    }

    /// Fail every waiting job of a cancelled run
    pub async fn cancel_waiting(&self, run_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', last_error = ?, finished_at = ?
            WHERE run_id = ? AND state = 'waiting'
            "#,
        )
        .bind(RUN_CANCELLED_MESSAGE)
        .bind(now_ms())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!("🛑 Removed {} waiting job(s) for cancelled run {}", result.rows_affected(), run_id);
        }
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn stats(&self) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = JobCounts::default();
        for row in &rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let n = n.max(0) as u64;
            match JobState::parse(&state)? {
                JobState::Waiting => counts.waiting = n,
                JobState::Active => counts.active = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Keep only the `keep` most recently finished jobs in `state`
    async fn prune(&self, state: JobState, keep: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state = ? AND id NOT IN (
                SELECT id FROM jobs WHERE state = ?
                ORDER BY finished_at DESC, id DESC
                LIMIT ?
            )
            "#,
        )
        .bind(state.as_str())
        .bind(state.as_str())
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!("🧹 Pruned {} {} job(s)", result.rows_affected(), state.as_str());
        }
        Ok(())
    }
}
