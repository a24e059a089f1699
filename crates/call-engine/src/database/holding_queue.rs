//! Inbound holding queue rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::missed_contacts::insert_missed_contact;
use super::{decode_enum, DatabaseManager};
use crate::error::{CallCenterError, Result};

string_enum! {
    pub enum HoldingStatus {
        Waiting => "WAITING",
        Assigned => "ASSIGNED",
        Connected => "CONNECTED",
        Abandoned => "ABANDONED",
        Completed => "COMPLETED",
    }
}

impl HoldingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HoldingStatus::Abandoned | HoldingStatus::Completed)
    }
}

/// Holding queue record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbHoldingEntry {
    pub call_id: String,
    pub caller_number: Option<String>,
    pub subject_id: Option<String>,
    pub priority: i32,
    pub position: u32,
    pub estimated_wait_secs: u32,
    pub entered_at: DateTime<Utc>,
    pub arrival_seq: i64,
    pub status: HoldingStatus,
    pub attempt_count: u32,
    pub last_attempted_agent_id: Option<String>,
    /// Agents that already failed to connect this call
    pub failed_agents: Vec<String>,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl DbHoldingEntry {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let failed: String = row.try_get("failed_agents")?;
        Ok(Self {
            call_id: row.try_get("call_id")?,
            caller_number: row.try_get("caller_number")?,
            subject_id: row.try_get("subject_id")?,
            priority: row.try_get::<i64, _>("priority")? as i32,
            position: row.try_get::<i64, _>("position")?.max(0) as u32,
            estimated_wait_secs: row.try_get::<i64, _>("estimated_wait_secs")?.max(0) as u32,
            entered_at: row.try_get("entered_at")?,
            arrival_seq: row.try_get("arrival_seq")?,
            status: decode_enum(row, "status")?,
            attempt_count: row.try_get::<i64, _>("attempt_count")?.max(0) as u32,
            last_attempted_agent_id: row.try_get("last_attempted_agent_id")?,
            failed_agents: serde_json::from_str(&failed)?,
            assigned_agent_id: row.try_get("assigned_agent_id")?,
            assigned_at: row.try_get("assigned_at")?,
            connected_at: row.try_get("connected_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_secs: row.try_get::<Option<i64>, _>("duration_secs")?.map(|d| d.max(0) as u32),
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub fn waited_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.ended_at.unwrap_or(now) - self.entered_at).num_seconds().max(0)
    }
}

/// A caller about to be placed on hold
#[derive(Debug, Clone)]
pub struct NewHoldingEntry {
    pub call_id: String,
    pub caller_number: Option<String>,
    pub subject_id: Option<String>,
    pub priority: i32,
}

const HOLDING_COLUMNS: &str = "call_id, caller_number, subject_id, priority, position, estimated_wait_secs, \
     entered_at, arrival_seq, status, attempt_count, last_attempted_agent_id, failed_agents, assigned_agent_id, \
     assigned_at, connected_at, ended_at, duration_secs, updated_at";

pub(crate) async fn count_live_holding(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM holding_queue WHERE status IN ('WAITING', 'ASSIGNED')")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count.max(0) as u64)
}

pub(crate) async fn fetch_holding_entry(conn: &mut SqliteConnection, call_id: &str) -> Result<Option<DbHoldingEntry>> {
    let row = sqlx::query(&format!("SELECT {} FROM holding_queue WHERE call_id = ?", HOLDING_COLUMNS))
        .bind(call_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(DbHoldingEntry::from_row).transpose()
}

pub(crate) async fn insert_holding_entry(
    conn: &mut SqliteConnection,
    entry: &NewHoldingEntry,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO holding_queue (call_id, caller_number, subject_id, priority, entered_at, arrival_seq,
                                    status, updated_at)
         VALUES (?, ?, ?, ?, ?, (SELECT COALESCE(MAX(arrival_seq), 0) + 1 FROM holding_queue), 'WAITING', ?)",
    )
    .bind(&entry.call_id)
    .bind(&entry.caller_number)
    .bind(&entry.subject_id)
    .bind(entry.priority as i64)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Rewrite position and estimated wait for every WAITING entry, ordered by
/// (priority, entered_at, arrival_seq). Returns the number of entries touched.
pub(crate) async fn reorder_waiting<F>(conn: &mut SqliteConnection, estimate_wait: F, now: DateTime<Utc>) -> Result<u32>
where
    F: Fn(u32) -> u32,
{
    let waiting: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT call_id, position, estimated_wait_secs FROM holding_queue
         WHERE status = 'WAITING'
         ORDER BY priority ASC, entered_at ASC, arrival_seq ASC",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut position = 0u32;
    for (call_id, old_position, old_wait) in waiting {
        position += 1;
        let wait = estimate_wait(position);
        if old_position == position as i64 && old_wait == wait as i64 {
            continue;
        }
        sqlx::query(
            "UPDATE holding_queue SET position = ?, estimated_wait_secs = ?, updated_at = ?
             WHERE call_id = ? AND status = 'WAITING'",
        )
        .bind(position as i64)
        .bind(wait as i64)
        .bind(now)
        .bind(&call_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(position)
}

/// Bind an agent to a claimed (ASSIGNED, unbound) entry and count the attempt
pub(crate) async fn bind_holding_agent(
    conn: &mut SqliteConnection,
    call_id: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE holding_queue
         SET assigned_agent_id = ?, assigned_at = ?, attempt_count = attempt_count + 1,
             last_attempted_agent_id = ?, position = 0, updated_at = ?
         WHERE call_id = ? AND status = 'ASSIGNED' AND assigned_agent_id IS NULL",
    )
    .bind(agent_id)
    .bind(now)
    .bind(agent_id)
    .bind(now)
    .bind(call_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

impl DatabaseManager {
    pub async fn get_holding_entry(&self, call_id: &str) -> Result<Option<DbHoldingEntry>> {
        let mut conn = self.pool.acquire().await?;
        fetch_holding_entry(&mut conn, call_id).await
    }

    /// WAITING entries in queue order
    pub async fn waiting_entries(&self) -> Result<Vec<DbHoldingEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM holding_queue WHERE status = 'WAITING'
             ORDER BY priority ASC, entered_at ASC, arrival_seq ASC",
            HOLDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbHoldingEntry::from_row).collect()
    }

    /// Head of the holding queue, if any
    pub async fn best_waiting_call_id(&self) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT call_id FROM holding_queue WHERE status = 'WAITING'
             ORDER BY priority ASC, entered_at ASC, arrival_seq ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// WAITING → ASSIGNED with no agent bound yet
    pub async fn claim_waiting(&self, call_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'ASSIGNED', assigned_agent_id = NULL, assigned_at = ?, updated_at = ?
             WHERE call_id = ? AND status = 'WAITING'",
        )
        .bind(now)
        .bind(now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// ASSIGNED → WAITING; only for entries no agent has been bound to
    pub async fn return_to_waiting(&self, call_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'WAITING', assigned_at = NULL, updated_at = ?
             WHERE call_id = ? AND status = 'ASSIGNED' AND assigned_agent_id IS NULL",
        )
        .bind(now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// ASSIGNED (agent bound) → CONNECTED
    pub async fn mark_holding_connected(&self, call_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'CONNECTED', connected_at = ?, updated_at = ?
             WHERE call_id = ? AND status = 'ASSIGNED' AND assigned_agent_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(call_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// CONNECTED → COMPLETED
    pub async fn mark_holding_completed(&self, call_id: &str, duration_secs: u32, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'COMPLETED', ended_at = ?, duration_secs = ?, updated_at = ?
             WHERE call_id = ? AND status = 'CONNECTED'",
        )
        .bind(now)
        .bind(duration_secs as i64)
        .bind(now)
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// WAITING/ASSIGNED → ABANDONED plus a missed-contact record, in one
    /// transaction. Returns the entry as it was before abandonment, or `None` if
    /// it was already terminal or connected.
    pub async fn abandon_holding_entry(
        &self,
        call_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DbHoldingEntry>> {
        let mut tx = self.begin_write().await?;

        let Some(entry) = fetch_holding_entry(&mut *tx, call_id).await? else {
            return Err(CallCenterError::not_found(format!("call {}", call_id)));
        };

        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'ABANDONED', ended_at = ?, position = 0, updated_at = ?
             WHERE call_id = ? AND status IN ('WAITING', 'ASSIGNED')",
        )
        .bind(now)
        .bind(now)
        .bind(call_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        insert_missed_contact(&mut *tx, &entry, reason, now).await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    /// Record that `agent_id` failed to connect this call and put it back in
    /// WAITING. Returns the updated entry, or `None` if the call was not bound to
    /// that agent.
    pub async fn record_failed_attempt(
        &self,
        call_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DbHoldingEntry>> {
        let mut tx = self.begin_write().await?;

        let Some(mut entry) = fetch_holding_entry(&mut *tx, call_id).await? else {
            return Err(CallCenterError::not_found(format!("call {}", call_id)));
        };

        if !entry.failed_agents.iter().any(|a| a == agent_id) {
            entry.failed_agents.push(agent_id.to_string());
        }

        let result = sqlx::query(
            "UPDATE holding_queue
             SET status = 'WAITING', failed_agents = ?, assigned_agent_id = NULL, assigned_at = NULL, updated_at = ?
             WHERE call_id = ? AND status = 'ASSIGNED' AND assigned_agent_id = ?",
        )
        .bind(serde_json::to_string(&entry.failed_agents)?)
        .bind(now)
        .bind(call_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        tx.commit().await?;
        entry.status = HoldingStatus::Waiting;
        entry.assigned_agent_id = None;
        entry.assigned_at = None;
        Ok(Some(entry))
    }

    /// ASSIGNED entries that never got an agent bound before `cutoff` go back to WAITING
    pub async fn recover_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE holding_queue SET status = 'WAITING', assigned_at = NULL, updated_at = ?
             WHERE status = 'ASSIGNED' AND assigned_agent_id IS NULL AND assigned_at < ?",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete terminal entries that ended before `cutoff`
    pub async fn purge_terminal_holding(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM holding_queue WHERE status IN ('ABANDONED', 'COMPLETED') AND ended_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mean duration of the most recent completed calls
    pub async fn average_recent_call_duration(&self, sample: u32) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration_secs) FROM (
                 SELECT duration_secs FROM holding_queue
                 WHERE status = 'COMPLETED' AND duration_secs IS NOT NULL
                 ORDER BY ended_at DESC LIMIT ?
             )",
        )
        .bind(sample.max(1) as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }

    pub async fn holding_status_counts(&self) -> Result<Vec<(HoldingStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM holding_queue GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((decode_enum(row, "status")?, row.try_get::<i64, _>("n")?.max(0) as u64)))
            .collect()
    }

    pub async fn oldest_waiting_since(&self) -> Result<Option<DateTime<Utc>>> {
        let oldest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MIN(entered_at) FROM holding_queue WHERE status = 'WAITING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(oldest)
    }
}
