use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::DatabaseManager;
use crate::error::Result;

/// One persisted reconciler run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbReconciliationRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_offset: u64,
    pub next_offset: u64,
    pub dry_run: bool,
    pub outcome: String,
    pub processed: u64,
    pub errors: u64,
    /// Full report as written by the reconciler
    pub report: serde_json::Value,
}

impl DbReconciliationRun {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let report: String = row.try_get("report_json")?;
        Ok(Self {
            run_id: row.try_get("run_id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            start_offset: row.try_get::<i64, _>("start_offset")?.max(0) as u64,
            next_offset: row.try_get::<i64, _>("next_offset")?.max(0) as u64,
            dry_run: row.try_get("dry_run")?,
            outcome: row.try_get("outcome")?,
            processed: row.try_get::<i64, _>("processed")?.max(0) as u64,
            errors: row.try_get::<i64, _>("errors")?.max(0) as u64,
            report: serde_json::from_str(&report)?,
        })
    }
}

impl DatabaseManager {
    pub async fn insert_reconciliation_run(&self, run: &DbReconciliationRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO reconciliation_runs (run_id, started_at, finished_at, start_offset, next_offset, dry_run,
                                              outcome, processed, errors, report_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.start_offset as i64)
        .bind(run.next_offset as i64)
        .bind(run.dry_run)
        .bind(&run.outcome)
        .bind(run.processed as i64)
        .bind(run.errors as i64)
        .bind(serde_json::to_string(&run.report)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_reconciliation_runs(&self, limit: u32) -> Result<Vec<DbReconciliationRun>> {
        let rows = sqlx::query("SELECT * FROM reconciliation_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DbReconciliationRun::from_row).collect()
    }

    pub async fn latest_reconciliation_run(&self) -> Result<Option<DbReconciliationRun>> {
        Ok(self.recent_reconciliation_runs(1).await?.into_iter().next())
    }
}
