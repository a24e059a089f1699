use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::holding_queue::DbHoldingEntry;
use super::DatabaseManager;
use crate::error::Result;

/// Inbound call that ended without ever reaching an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbMissedContact {
    pub missed_id: String,
    pub call_id: String,
    pub caller_number: Option<String>,
    pub subject_id: Option<String>,
    pub reason: String,
    pub waited_secs: i64,
    pub attempt_count: u32,
    pub recorded_at: DateTime<Utc>,
}

impl DbMissedContact {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            missed_id: row.try_get("missed_id")?,
            call_id: row.try_get("call_id")?,
            caller_number: row.try_get("caller_number")?,
            subject_id: row.try_get("subject_id")?,
            reason: row.try_get("reason")?,
            waited_secs: row.try_get("waited_secs")?,
            attempt_count: row.try_get::<i64, _>("attempt_count")?.max(0) as u32,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

pub(crate) async fn insert_missed_contact(
    conn: &mut SqliteConnection,
    entry: &DbHoldingEntry,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    // A call can only be missed once; a replayed hangup must not duplicate the record.
    sqlx::query(
        "INSERT INTO missed_contacts (missed_id, call_id, caller_number, subject_id, reason, waited_secs,
                                      attempt_count, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(call_id) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&entry.call_id)
    .bind(&entry.caller_number)
    .bind(&entry.subject_id)
    .bind(reason)
    .bind(entry.waited_secs(now))
    .bind(entry.attempt_count as i64)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl DatabaseManager {
    pub async fn get_missed_contact(&self, call_id: &str) -> Result<Option<DbMissedContact>> {
        let row = sqlx::query("SELECT * FROM missed_contacts WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DbMissedContact::from_row).transpose()
    }

    /// Most recent missed contacts first
    pub async fn list_missed_contacts(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<DbMissedContact>> {
        let rows = sqlx::query(
            "SELECT * FROM missed_contacts WHERE recorded_at >= ? ORDER BY recorded_at DESC LIMIT ?",
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DbMissedContact::from_row).collect()
    }

    pub async fn count_missed_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM missed_contacts WHERE recorded_at >= ?")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::holding_queue::{insert_holding_entry, NewHoldingEntry};
    use chrono::Duration;

    #[tokio::test]
    async fn test_abandon_writes_missed_contact_once() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let entered = Utc::now() - Duration::seconds(45);
        {
            let mut conn = db.pool().acquire().await.unwrap();
            insert_holding_entry(
                &mut conn,
                &NewHoldingEntry {
                    call_id: "call-1".to_string(),
                    caller_number: Some("+15550001".to_string()),
                    subject_id: None,
                    priority: 100,
                },
                entered,
            )
            .await
            .unwrap();
        }

        let now = Utc::now();
        let abandoned = db.abandon_holding_entry("call-1", "caller_hangup", now).await.unwrap();
        assert!(abandoned.is_some());
        // Second hangup for the same call is a no-op
        assert!(db.abandon_holding_entry("call-1", "caller_hangup", now).await.unwrap().is_none());

        let missed = db.get_missed_contact("call-1").await.unwrap().unwrap();
        assert_eq!(missed.reason, "caller_hangup");
        assert!(missed.waited_secs >= 45);
        assert_eq!(db.count_missed_since(entered).await.unwrap(), 1);
    }
}
