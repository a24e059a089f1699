//! Outbound queue entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{decode_enum, DatabaseManager};
use crate::error::Result;
use crate::routing::types::QueueCategory;

string_enum! {
    pub enum EntryStatus {
        Pending => "PENDING",
        Assigned => "ASSIGNED",
        Completed => "COMPLETED",
        Invalid => "INVALID",
    }
}

impl EntryStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Assigned)
    }
}

/// Queue entry record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbQueueEntry {
    pub entry_id: String,
    pub subject_id: String,
    pub category: QueueCategory,
    pub priority: i32,
    pub status: EntryStatus,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub callback_id: Option<String>,
    pub reason: Option<String>,
    pub target_agent_id: Option<String>,
    pub available_not_before: Option<DateTime<Utc>>,
    /// Agents whose leg failed for this entry; they are not offered it again
    pub failed_agents: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DbQueueEntry {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let failed: String = row.try_get("failed_agents")?;
        Ok(Self {
            entry_id: row.try_get("entry_id")?,
            subject_id: row.try_get("subject_id")?,
            category: decode_enum(row, "category")?,
            priority: row.try_get::<i64, _>("priority")? as i32,
            status: decode_enum(row, "status")?,
            assigned_agent_id: row.try_get("assigned_agent_id")?,
            assigned_at: row.try_get("assigned_at")?,
            callback_id: row.try_get("callback_id")?,
            reason: row.try_get("reason")?,
            target_agent_id: row.try_get("target_agent_id")?,
            available_not_before: row.try_get("available_not_before")?,
            failed_agents: serde_json::from_str(&failed)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    pub fn is_callback(&self) -> bool {
        self.callback_id.is_some()
    }
}

/// Fields for a new PENDING entry
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub subject_id: String,
    pub category: QueueCategory,
    pub priority: i32,
    pub callback_id: Option<String>,
    pub reason: Option<String>,
    pub target_agent_id: Option<String>,
    pub available_not_before: Option<DateTime<Utc>>,
}

impl NewQueueEntry {
    /// A normal reconciler-created entry
    pub fn scored(subject_id: &str, category: QueueCategory, priority: i32) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            category,
            priority,
            callback_id: None,
            reason: Some("reconciled".to_string()),
            target_agent_id: None,
            available_not_before: None,
        }
    }
}

pub(crate) const ENTRY_COLUMNS: &str = "entry_id, subject_id, category, priority, status, assigned_agent_id, \
     assigned_at, callback_id, reason, target_agent_id, available_not_before, failed_agents, created_at, updated_at, \
     completed_at";

/// Insert a PENDING entry. Fails on the live-entry unique index if the subject
/// already has a live entry in this category.
pub(crate) async fn insert_entry(conn: &mut SqliteConnection, entry: &NewQueueEntry, now: DateTime<Utc>) -> Result<String> {
    let entry_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO queue_entries (entry_id, subject_id, category, priority, status, callback_id, reason,
                                    target_agent_id, available_not_before, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'PENDING', ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry_id)
    .bind(&entry.subject_id)
    .bind(entry.category.as_str())
    .bind(entry.priority as i64)
    .bind(&entry.callback_id)
    .bind(&entry.reason)
    .bind(&entry.target_agent_id)
    .bind(entry.available_not_before)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(entry_id)
}

pub(crate) async fn live_entries_for_subject(conn: &mut SqliteConnection, subject_id: &str) -> Result<Vec<DbQueueEntry>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM queue_entries
         WHERE subject_id = ? AND status IN ('PENDING', 'ASSIGNED')
         ORDER BY created_at",
        ENTRY_COLUMNS
    ))
    .bind(subject_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(DbQueueEntry::from_row).collect()
}

/// PENDING → ASSIGNED for a specific agent; false if someone else got there first
pub(crate) async fn assign_entry(
    conn: &mut SqliteConnection,
    entry_id: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE queue_entries SET status = 'ASSIGNED', assigned_agent_id = ?, assigned_at = ?, updated_at = ?
         WHERE entry_id = ? AND status = 'PENDING'",
    )
    .bind(agent_id)
    .bind(now)
    .bind(now)
    .bind(entry_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Invalidate every PENDING entry for a subject except `keep_entry_id`
pub(crate) async fn invalidate_other_pending(
    conn: &mut SqliteConnection,
    subject_id: &str,
    keep_entry_id: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queue_entries SET status = 'INVALID', reason = ?, updated_at = ?
         WHERE subject_id = ? AND status = 'PENDING' AND entry_id != COALESCE(?, '')",
    )
    .bind(reason)
    .bind(now)
    .bind(subject_id)
    .bind(keep_entry_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

impl DatabaseManager {
    pub async fn live_entries(&self, subject_id: &str) -> Result<Vec<DbQueueEntry>> {
        let mut conn = self.pool.acquire().await?;
        live_entries_for_subject(&mut conn, subject_id).await
    }

    pub async fn get_queue_entry(&self, entry_id: &str) -> Result<Option<DbQueueEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM queue_entries WHERE entry_id = ?", ENTRY_COLUMNS))
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DbQueueEntry::from_row).transpose()
    }

    pub async fn entries_for_callback(&self, callback_id: &str) -> Result<Vec<DbQueueEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queue_entries WHERE callback_id = ? ORDER BY created_at",
            ENTRY_COLUMNS
        ))
        .bind(callback_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbQueueEntry::from_row).collect()
    }

    /// PENDING entries that may be worked now, most urgent first.
    ///
    /// Entries not yet available and (non-callback) entries of subjects in
    /// cooldown are skipped.
    pub async fn next_outbound_candidates(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DbQueueEntry>> {
        let columns = ENTRY_COLUMNS
            .split(", ")
            .map(|c| format!("e.{}", c))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queue_entries e
             LEFT JOIN queue_state qs ON qs.subject_id = e.subject_id
             WHERE e.status = 'PENDING'
               AND (e.available_not_before IS NULL OR e.available_not_before <= ?)
               AND (e.callback_id IS NOT NULL OR qs.cooldown_until IS NULL OR qs.cooldown_until <= ?)
             ORDER BY e.priority ASC, e.created_at ASC
             LIMIT ?",
            columns
        ))
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbQueueEntry::from_row).collect()
    }

    /// ASSIGNED → PENDING, e.g. after the agent's phone failed. A `failed_agent`
    /// is added to the entry's exclusion list.
    pub async fn release_entry(&self, entry_id: &str, failed_agent: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        let row = sqlx::query("SELECT failed_agents FROM queue_entries WHERE entry_id = ? AND status = 'ASSIGNED'")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let mut failed: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("failed_agents")?)?;
        if let Some(agent) = failed_agent {
            if !failed.iter().any(|a| a == agent) {
                failed.push(agent.to_string());
            }
        }
        sqlx::query(
            "UPDATE queue_entries
             SET status = 'PENDING', assigned_agent_id = NULL, assigned_at = NULL, failed_agents = ?, updated_at = ?
             WHERE entry_id = ? AND status = 'ASSIGNED'",
        )
        .bind(serde_json::to_string(&failed)?)
        .bind(now)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// ASSIGNED → COMPLETED
    pub async fn complete_entry(&self, entry_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_entries SET status = 'COMPLETED', completed_at = ?, updated_at = ?
             WHERE entry_id = ? AND status = 'ASSIGNED'",
        )
        .bind(now)
        .bind(now)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Invalidate PENDING entries whose subject no longer exists, and non-callback
    /// entries whose subject is no longer reachable
    pub async fn invalidate_orphaned_entries(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE queue_entries SET status = 'INVALID', reason = 'orphaned', updated_at = ?
             WHERE status = 'PENDING'
               AND (
                   subject_id NOT IN (SELECT subject_id FROM subjects)
                   OR (callback_id IS NULL AND subject_id NOT IN (
                       SELECT subject_id FROM subjects WHERE active = 1 AND enabled = 1 AND contactable = 1
                   ))
               )",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Live entries grouped by category and status
    pub async fn live_entry_counts(&self) -> Result<Vec<(QueueCategory, EntryStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT category, status, COUNT(*) AS n FROM queue_entries
             WHERE status IN ('PENDING', 'ASSIGNED')
             GROUP BY category, status ORDER BY category, status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    decode_enum(row, "category")?,
                    decode_enum(row, "status")?,
                    row.try_get::<i64, _>("n")?.max(0) as u64,
                ))
            })
            .collect()
    }

    /// (subject, category) pairs holding more than one live entry
    pub async fn duplicate_live_entries(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT subject_id, category FROM queue_entries
             WHERE status IN ('PENDING', 'ASSIGNED')
             GROUP BY subject_id, category HAVING COUNT(*) > 1",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("subject_id")?, row.try_get("category")?)))
            .collect()
    }
}
