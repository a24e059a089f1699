//! Scheduled callbacks and their override-priority queue entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;
use uuid::Uuid;

use super::queue_entries::{insert_entry, invalidate_other_pending, live_entries_for_subject, NewQueueEntry};
use super::{decode_enum, DatabaseManager, EntryStatus};
use crate::error::{CallCenterError, Result};
use crate::routing::QueueCategory;

string_enum! {
    pub enum CallbackStatus {
        Pending => "PENDING",
        Accepted => "ACCEPTED",
        Completed => "COMPLETED",
    }
}

/// Callback record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbCallback {
    pub callback_id: String,
    pub subject_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub reason: String,
    pub preferred_agent_id: Option<String>,
    pub status: CallbackStatus,
    pub origin_call_id: Option<String>,
    pub accepted_by: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_injected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DbCallback {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            callback_id: row.try_get("callback_id")?,
            subject_id: row.try_get("subject_id")?,
            scheduled_for: row.try_get("scheduled_for")?,
            reason: row.try_get("reason")?,
            preferred_agent_id: row.try_get("preferred_agent_id")?,
            status: decode_enum(row, "status")?,
            origin_call_id: row.try_get("origin_call_id")?,
            accepted_by: row.try_get("accepted_by")?,
            accepted_at: row.try_get("accepted_at")?,
            completed_at: row.try_get("completed_at")?,
            last_injected_at: row.try_get("last_injected_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status != CallbackStatus::Completed && self.scheduled_for < now
    }
}

/// Request to schedule a callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCallback {
    pub subject_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub preferred_agent_id: Option<String>,
    #[serde(default)]
    pub origin_call_id: Option<String>,
}

/// What happened to a subject's queue entries when a callback was injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InjectionEffect {
    /// A new override entry was inserted
    Created,
    /// The callback already had a pending entry; it was refreshed in place
    Refreshed,
    /// Another callback's looser entry was taken over and tightened
    Adopted,
    /// Another callback's entry is at least as urgent; it stays the subject's
    /// only override entry
    Covered,
    /// The subject is on a call right now; nothing was touched
    SkippedAssigned,
}

/// Category an override entry is filed under: the subject's queue if it has
/// one, else `NONE`.
async fn callback_entry_category(conn: &mut SqliteConnection, subject_id: &str) -> Result<QueueCategory> {
    let stored: Option<Option<String>> = sqlx::query_scalar("SELECT category FROM queue_state WHERE subject_id = ?")
        .bind(subject_id)
        .fetch_optional(&mut *conn)
        .await?;
    let category = match stored.flatten() {
        Some(raw) => raw.parse::<QueueCategory>().map_err(|e| {
            CallCenterError::inconsistency(format!("queue_state.category for {}: {}", subject_id, e))
        })?,
        None => QueueCategory::Ineligible,
    };
    Ok(if category.is_queueable() { category } else { QueueCategory::Ineligible })
}

async fn fetch_callback(conn: &mut SqliteConnection, callback_id: &str) -> Result<Option<DbCallback>> {
    let row = sqlx::query("SELECT * FROM callbacks WHERE callback_id = ?")
        .bind(callback_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(DbCallback::from_row).transpose()
}

/// Leave the subject with exactly one pending override entry, owned by the
/// most urgent of its callbacks. This callback's entry ends up at `priority` or
/// tighter, routed to `target_agent_id`, unless another callback already holds
/// an entry at least as urgent.
async fn upsert_override_entry(
    conn: &mut SqliteConnection,
    callback: &DbCallback,
    priority: i32,
    target_agent_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<InjectionEffect> {
    let live = live_entries_for_subject(&mut *conn, &callback.subject_id).await?;

    if live.iter().any(|e| e.status == EntryStatus::Assigned) {
        return Ok(InjectionEffect::SkippedAssigned);
    }

    let reason = format!("callback:{} {}", callback.callback_id, callback.reason);
    let own = live
        .iter()
        .find(|e| e.callback_id.as_deref() == Some(callback.callback_id.as_str()));
    let holder = live
        .iter()
        .filter(|e| e.is_callback() && e.callback_id.as_deref() != Some(callback.callback_id.as_str()))
        .min_by_key(|e| e.priority);
    let wanted = own.map_or(priority, |e| e.priority.min(priority));

    if let Some(holder) = holder.filter(|h| h.priority <= wanted) {
        invalidate_other_pending(&mut *conn, &callback.subject_id, Some(&holder.entry_id), "superseded_by_callback", now)
            .await?;
        return Ok(InjectionEffect::Covered);
    }

    if let Some(existing) = own {
        sqlx::query(
            "UPDATE queue_entries
             SET priority = MIN(priority, ?), target_agent_id = COALESCE(?, target_agent_id),
                 available_not_before = ?, updated_at = ?
             WHERE entry_id = ? AND status = 'PENDING'",
        )
        .bind(priority as i64)
        .bind(target_agent_id)
        .bind(callback.scheduled_for)
        .bind(now)
        .bind(&existing.entry_id)
        .execute(&mut *conn)
        .await?;
        invalidate_other_pending(&mut *conn, &callback.subject_id, Some(&existing.entry_id), "superseded_by_callback", now)
            .await?;
        return Ok(InjectionEffect::Refreshed);
    }

    if let Some(looser) = holder {
        sqlx::query(
            "UPDATE queue_entries
             SET callback_id = ?, priority = MIN(priority, ?), target_agent_id = ?, available_not_before = ?,
                 reason = ?, updated_at = ?
             WHERE entry_id = ? AND status = 'PENDING'",
        )
        .bind(&callback.callback_id)
        .bind(priority as i64)
        .bind(target_agent_id)
        .bind(callback.scheduled_for)
        .bind(&reason)
        .bind(now)
        .bind(&looser.entry_id)
        .execute(&mut *conn)
        .await?;
        invalidate_other_pending(&mut *conn, &callback.subject_id, Some(&looser.entry_id), "superseded_by_callback", now)
            .await?;
        return Ok(InjectionEffect::Adopted);
    }

    invalidate_other_pending(&mut *conn, &callback.subject_id, None, "superseded_by_callback", now).await?;
    let category = callback_entry_category(&mut *conn, &callback.subject_id).await?;
    insert_entry(
        &mut *conn,
        &NewQueueEntry {
            subject_id: callback.subject_id.clone(),
            category,
            priority,
            callback_id: Some(callback.callback_id.clone()),
            reason: Some(reason),
            target_agent_id: target_agent_id.map(str::to_string),
            available_not_before: Some(callback.scheduled_for),
        },
        now,
    )
    .await?;
    Ok(InjectionEffect::Created)
}

impl DatabaseManager {
    pub async fn insert_callback(&self, callback: &NewCallback, now: DateTime<Utc>) -> Result<DbCallback> {
        let callback_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO callbacks (callback_id, subject_id, scheduled_for, reason, preferred_agent_id, status,
                                    origin_call_id, created_at)
             VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?)",
        )
        .bind(&callback_id)
        .bind(&callback.subject_id)
        .bind(callback.scheduled_for)
        .bind(&callback.reason)
        .bind(&callback.preferred_agent_id)
        .bind(&callback.origin_call_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_callback(&callback_id)
            .await?
            .ok_or_else(|| CallCenterError::internal(format!("callback {} vanished after insert", callback_id)))
    }

    pub async fn get_callback(&self, callback_id: &str) -> Result<Option<DbCallback>> {
        let mut conn = self.pool.acquire().await?;
        fetch_callback(&mut conn, callback_id).await
    }

    /// PENDING callbacks scheduled inside `[from, to]`
    pub async fn upcoming_callbacks(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<DbCallback>> {
        let rows = sqlx::query(
            "SELECT * FROM callbacks
             WHERE status = 'PENDING' AND scheduled_for >= ? AND scheduled_for <= ?
             ORDER BY scheduled_for",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbCallback::from_row).collect()
    }

    /// PENDING or ACCEPTED callbacks scheduled strictly before `now`
    pub async fn overdue_callbacks(&self, now: DateTime<Utc>) -> Result<Vec<DbCallback>> {
        let rows = sqlx::query(
            "SELECT * FROM callbacks
             WHERE status IN ('PENDING', 'ACCEPTED') AND scheduled_for < ?
             ORDER BY scheduled_for",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbCallback::from_row).collect()
    }

    pub async fn count_open_callbacks(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(status = 'PENDING'), 0) AS pending,
                    COALESCE(SUM(status = 'ACCEPTED'), 0) AS accepted
             FROM callbacks",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.try_get::<i64, _>("pending")?.max(0) as u64,
            row.try_get::<i64, _>("accepted")?.max(0) as u64,
        ))
    }

    /// Create or refresh the callback's override entry and stamp the injection
    /// time, in one transaction.
    pub async fn inject_callback(
        &self,
        callback: &DbCallback,
        priority: i32,
        target_agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<InjectionEffect> {
        let mut tx = self.begin_write().await?;
        let effect = upsert_override_entry(&mut *tx, callback, priority, target_agent_id, now).await?;

        if effect != InjectionEffect::SkippedAssigned {
            sqlx::query("UPDATE callbacks SET last_injected_at = ? WHERE callback_id = ?")
                .bind(now)
                .bind(&callback.callback_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("Injected callback {} at {}: {:?}", callback.callback_id, priority, effect);
        Ok(effect)
    }

    /// PENDING → ACCEPTED. Tightens the override entry to `accepted_priority`
    /// and routes it to the accepting agent. Returns `None` if the callback was
    /// not pending.
    pub async fn accept_callback(
        &self,
        callback_id: &str,
        agent_id: &str,
        accepted_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<DbCallback>> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            "UPDATE callbacks SET status = 'ACCEPTED', accepted_by = ?, accepted_at = ?
             WHERE callback_id = ? AND status = 'PENDING'",
        )
        .bind(agent_id)
        .bind(now)
        .bind(callback_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists = fetch_callback(&mut *tx, callback_id).await?.is_some();
            tx.rollback().await?;
            return if exists {
                Ok(None)
            } else {
                Err(CallCenterError::not_found(format!("callback {}", callback_id)))
            };
        }

        let callback = fetch_callback(&mut *tx, callback_id)
            .await?
            .ok_or_else(|| CallCenterError::internal(format!("callback {} vanished during accept", callback_id)))?;
        upsert_override_entry(&mut *tx, &callback, accepted_priority, Some(agent_id), now).await?;

        tx.commit().await?;
        Ok(Some(callback))
    }

    /// PENDING/ACCEPTED → COMPLETED; the callback's pending entries are
    /// invalidated. Returns false if it was already completed.
    pub async fn complete_callback(&self, callback_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        let completed = complete_callback_in(&mut *tx, callback_id, now).await?;
        tx.commit().await?;
        Ok(completed)
    }
}

pub(crate) async fn complete_callback_in(conn: &mut SqliteConnection, callback_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE callbacks SET status = 'COMPLETED', completed_at = ?
         WHERE callback_id = ? AND status IN ('PENDING', 'ACCEPTED')",
    )
    .bind(now)
    .bind(callback_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    sqlx::query(
        "UPDATE queue_entries SET status = 'INVALID', reason = 'callback_completed', updated_at = ?
         WHERE callback_id = ? AND status = 'PENDING'",
    )
    .bind(now)
    .bind(callback_id)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}
