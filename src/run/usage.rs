/// Usage metering
///
/// The worker reports successful runs and their node executions to a `UsageSink`.
/// The SQLite ledger keeps one row per workspace per calendar month (UTC).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};

/// Metered quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UsageMetric {
    Runs,
    NodeExecutions,
    ApiCalls,
}

impl UsageMetric {
    fn column(&self) -> &'static str {
        match self {
            UsageMetric::Runs => "runs_count",
            UsageMetric::NodeExecutions => "node_executions",
            UsageMetric::ApiCalls => "api_calls",
        }
    }
}

/// Usage-accounting collaborator
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn increment_usage(&self, workspace_id: &str, metric: UsageMetric, amount: u64) -> Result<()>;

    /// Count one successful run and its node executions. Sinks that can write both
    /// counters in one statement should override this.
    async fn record_run(&self, workspace_id: &str, node_executions: u64) -> Result<()> {
        self.increment_usage(workspace_id, UsageMetric::Runs, 1).await?;
        self.increment_usage(workspace_id, UsageMetric::NodeExecutions, node_executions).await
    }
}

/// Counters of one workspace for one billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub workspace_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub runs: u64,
    pub node_executions: u64,
    pub api_calls: u64,
}

/// SQLite usage ledger
#[derive(Debug, Clone)]
pub struct SqliteUsageLedger {
    pool: SqlitePool,
}

/// First and last day of the month containing `day`
fn billing_period(day: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = day.with_day(1).unwrap_or(day);
    let next_month = if start.month() == 12 {
        NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
    };
    let end = next_month.and_then(|d| d.pred_opt()).unwrap_or(start);
    (start, end)
}

impl SqliteUsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Usage of the current period, if anything was recorded yet
    pub async fn current_usage(&self, workspace_id: &str) -> Result<Option<UsageRecord>> {
        let (start, _) = billing_period(Utc::now().date_naive());

        let row = sqlx::query(
            r#"
            SELECT workspace_id, period_start, period_end, runs_count, node_executions, api_calls
            FROM usage_records WHERE workspace_id = ? AND period_start = ?
            "#,
        )
        .bind(workspace_id)
        .bind(start.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<UsageRecord> {
            let period_start: String = row.try_get("period_start")?;
            let period_end: String = row.try_get("period_end")?;
            Ok(UsageRecord {
                workspace_id: row.try_get("workspace_id")?,
                period_start: period_start.parse()?,
                period_end: period_end.parse()?,
                runs: row.try_get::<i64, _>("runs_count")?.max(0) as u64,
                node_executions: row.try_get::<i64, _>("node_executions")?.max(0) as u64,
                api_calls: row.try_get::<i64, _>("api_calls")?.max(0) as u64,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl UsageSink for SqliteUsageLedger {
    async fn increment_usage(&self, workspace_id: &str, metric: UsageMetric, amount: u64) -> Result<()> {
        let (start, end) = billing_period(Utc::now().date_naive());
        let column = metric.column();

        // Column names come from a closed enum, never from input
        sqlx::query(&format!(
            r#"
            INSERT INTO usage_records (workspace_id, period_start, period_end, {column})
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workspace_id, period_start) DO UPDATE SET
                {column} = {column} + excluded.{column}
            "#,
        ))
        .bind(workspace_id)
        .bind(start.to_string())
        .bind(end.to_string())
        .bind(amount as i64)
        .execute(&self.pool)
        .await?;

        tracing::debug!("📈 Usage +{} {:?} for workspace {}", amount, metric, workspace_id);
        Ok(())
    }

    async fn record_run(&self, workspace_id: &str, node_executions: u64) -> Result<()> {
        let (start, end) = billing_period(Utc::now().date_naive());

        sqlx::query(
            r#"
            INSERT INTO usage_records (workspace_id, period_start, period_end, runs_count, node_executions)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(workspace_id, period_start) DO UPDATE SET
                runs_count = runs_count + 1,
                node_executions = node_executions + excluded.node_executions
            "#,
        )
        .bind(workspace_id)
        .bind(start.to_string())
        .bind(end.to_string())
        .bind(node_executions as i64)
        .execute(&self.pool)
        .await?;

        tracing::debug!("📈 Usage +1 run, +{} node executions for workspace {}", node_executions, workspace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[test]
    fn test_billing_period_bounds() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 17).unwrap();
        assert_eq!(billing_period(day), (
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        ));

        let december = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(billing_period(december).1, december);
    }

    #[tokio::test]
    async fn test_increments_accumulate_per_metric() {
        let db = Database::in_memory().await.unwrap();
        let ledger = SqliteUsageLedger::new(db.pool().clone());

        assert!(ledger.current_usage("ws").await.unwrap().is_none());

        ledger.increment_usage("ws", UsageMetric::Runs, 1).await.unwrap();
        ledger.increment_usage("ws", UsageMetric::NodeExecutions, 4).await.unwrap();
        ledger.increment_usage("ws", UsageMetric::Runs, 1).await.unwrap();
        ledger.increment_usage("other", UsageMetric::ApiCalls, 9).await.unwrap();

        let usage = ledger.current_usage("ws").await.unwrap().unwrap();
        assert_eq!(usage.runs, 2);
        assert_eq!(usage.node_executions, 4);
        assert_eq!(usage.api_calls, 0);
    }

    #[tokio::test]
    async fn test_record_run_counts_both_metrics() {
        let db = Database::in_memory().await.unwrap();
        let ledger = SqliteUsageLedger::new(db.pool().clone());

        ledger.record_run("ws", 3).await.unwrap();
        ledger.record_run("ws", 0).await.unwrap();

        let usage = ledger.current_usage("ws").await.unwrap().unwrap();
        assert_eq!((usage.runs, usage.node_executions), (2, 3));
    }
}
