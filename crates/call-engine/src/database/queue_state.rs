//! Per-subject queue state and the atomic queue transition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use super::queue_entries::{insert_entry, live_entries_for_subject, EntryStatus, NewQueueEntry};
use super::{decode_optional_enum, DatabaseManager};
use crate::error::Result;
use crate::routing::types::{QueueCategory, QueueState};

/// Desired state for one subject, as computed by the reconciler
#[derive(Debug, Clone)]
pub struct StateChange {
    pub subject_id: String,
    pub category: QueueCategory,
    pub priority_score: i32,
    pub now: DateTime<Utc>,
}

/// What a queue transition actually changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub state_created: bool,
    pub entries_invalidated: u32,
    pub entry_created: bool,
    pub entry_reprioritized: bool,
    /// An ASSIGNED entry in another category is still being worked
    pub deferred_for_assigned: bool,
    /// Subject is cooling down; no normal entry was created
    pub in_cooldown: bool,
}

impl QueueState {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            subject_id: row.try_get("subject_id")?,
            category: decode_optional_enum(row, "category")?,
            priority_score: row.try_get::<i64, _>("priority_score")? as i32,
            active: row.try_get("active")?,
            cooldown_until: row.try_get("cooldown_until")?,
            last_reconciled_at: row.try_get("last_reconciled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

const STATE_COLUMNS: &str =
    "subject_id, category, priority_score, active, cooldown_until, last_reconciled_at, created_at, updated_at";

impl DatabaseManager {
    pub async fn get_queue_state(&self, subject_id: &str) -> Result<Option<QueueState>> {
        let row = sqlx::query(&format!("SELECT {} FROM queue_state WHERE subject_id = ?", STATE_COLUMNS))
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(QueueState::from_row).transpose()
    }

    /// Fetch the stored state for a batch of subjects in one query
    pub async fn get_queue_states(&self, subject_ids: &[String]) -> Result<HashMap<String, QueueState>> {
        let mut states = HashMap::with_capacity(subject_ids.len());
        if subject_ids.is_empty() {
            return Ok(states);
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM queue_state WHERE subject_id IN (",
            STATE_COLUMNS
        ));
        let mut separated = query.separated(", ");
        for id in subject_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        for row in query.build().fetch_all(&self.pool).await? {
            let state = QueueState::from_row(&row)?;
            states.insert(state.subject_id.clone(), state);
        }
        Ok(states)
    }

    /// Store a category and score for a subject and bring its live queue entries in
    /// line, all in one transaction.
    ///
    /// Live entries in another category are invalidated. A callback entry is carried
    /// into the new category; when the subject drops out of every queue a pending
    /// callback entry is left alone. While another category still has an ASSIGNED
    /// entry no new entry is created, so a subject never has two live entries.
    pub async fn apply_state_change(&self, change: &StateChange) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        let queueable = change.category.is_queueable();
        let mut tx = self.begin_write().await?;

        let cooldown_until: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT cooldown_until FROM queue_state WHERE subject_id = ?")
                .bind(&change.subject_id)
                .fetch_optional(&mut *tx)
                .await?;

        match cooldown_until {
            Some(_) => {
                sqlx::query(
                    "UPDATE queue_state
                     SET category = ?, priority_score = ?, active = ?, last_reconciled_at = ?, updated_at = ?
                     WHERE subject_id = ?",
                )
                .bind(change.category.as_str())
                .bind(change.priority_score as i64)
                .bind(queueable)
                .bind(change.now)
                .bind(change.now)
                .bind(&change.subject_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO queue_state (subject_id, category, priority_score, active,
                                              last_reconciled_at, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&change.subject_id)
                .bind(change.category.as_str())
                .bind(change.priority_score as i64)
                .bind(queueable)
                .bind(change.now)
                .bind(change.now)
                .bind(change.now)
                .execute(&mut *tx)
                .await?;
                outcome.state_created = true;
            }
        }

        let in_cooldown = cooldown_until.flatten().map_or(false, |until| until > change.now);

        let live = live_entries_for_subject(&mut *tx, &change.subject_id).await?;
        outcome.deferred_for_assigned = live
            .iter()
            .any(|e| e.status == EntryStatus::Assigned && !(queueable && e.category == change.category));
        let mut target_entry = None;
        let mut carried_callback = None;

        for entry in live {
            if queueable && entry.category == change.category {
                target_entry = Some(entry);
                continue;
            }

            if entry.status == EntryStatus::Assigned {
                continue;
            }

            // Callback entries stay put when there is nowhere to carry them
            if entry.callback_id.is_some() && (!queueable || outcome.deferred_for_assigned) {
                continue;
            }

            let invalidated = sqlx::query(
                "UPDATE queue_entries SET status = 'INVALID', reason = ?, updated_at = ?
                 WHERE entry_id = ? AND status = 'PENDING'",
            )
            .bind(format!("transition {} -> {}", entry.category, change.category))
            .bind(change.now)
            .bind(&entry.entry_id)
            .execute(&mut *tx)
            .await?;

            if invalidated.rows_affected() > 0 {
                outcome.entries_invalidated += 1;
                if entry.callback_id.is_some() {
                    carried_callback = Some(entry);
                }
            }
        }

        match (target_entry, carried_callback) {
            (Some(existing), Some(callback)) if existing.callback_id.is_none() && existing.status == EntryStatus::Pending => {
                sqlx::query(
                    "UPDATE queue_entries
                     SET priority = ?, callback_id = ?, reason = ?, target_agent_id = ?,
                         available_not_before = ?, updated_at = ?
                     WHERE entry_id = ? AND status = 'PENDING'",
                )
                .bind(callback.priority as i64)
                .bind(&callback.callback_id)
                .bind(&callback.reason)
                .bind(&callback.target_agent_id)
                .bind(callback.available_not_before)
                .bind(change.now)
                .bind(&existing.entry_id)
                .execute(&mut *tx)
                .await?;
                outcome.entry_reprioritized = true;
            }
            (Some(existing), _) => {
                if existing.callback_id.is_none()
                    && existing.status == EntryStatus::Pending
                    && existing.priority != change.priority_score
                {
                    sqlx::query(
                        "UPDATE queue_entries SET priority = ?, updated_at = ?
                         WHERE entry_id = ? AND status = 'PENDING' AND callback_id IS NULL",
                    )
                    .bind(change.priority_score as i64)
                    .bind(change.now)
                    .bind(&existing.entry_id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.entry_reprioritized = true;
                }
            }
            (None, carried) if queueable && !outcome.deferred_for_assigned => {
                let new_entry = match carried {
                    Some(callback) => Some(NewQueueEntry {
                        subject_id: change.subject_id.clone(),
                        category: change.category,
                        priority: callback.priority,
                        callback_id: callback.callback_id,
                        reason: callback.reason,
                        target_agent_id: callback.target_agent_id,
                        available_not_before: callback.available_not_before,
                    }),
                    None if in_cooldown => {
                        outcome.in_cooldown = true;
                        None
                    }
                    None => Some(NewQueueEntry::scored(
                        &change.subject_id,
                        change.category,
                        change.priority_score,
                    )),
                };

                if let Some(new_entry) = new_entry {
                    insert_entry(&mut *tx, &new_entry, change.now).await?;
                    outcome.entry_created = true;
                }
            }
            _ => {}
        }

        tx.commit().await?;
        debug!(
            "Applied {} -> {} (score {}): {:?}",
            change.subject_id, change.category, change.priority_score, outcome
        );
        Ok(outcome)
    }

    /// Start (or extend) a subject's cooldown
    pub async fn set_cooldown(&self, subject_id: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_state (subject_id, category, priority_score, active, cooldown_until, created_at, updated_at)
             VALUES (?, NULL, 0, 1, ?, ?, ?)
             ON CONFLICT(subject_id) DO UPDATE SET cooldown_until = excluded.cooldown_until, updated_at = excluded.updated_at",
        )
        .bind(subject_id)
        .bind(until)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deactivate states whose subject is gone or no longer reachable
    pub async fn deactivate_unreachable_states(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE queue_state SET active = 0, category = 'NONE', updated_at = ?
             WHERE active = 1
               AND subject_id NOT IN (
                   SELECT subject_id FROM subjects WHERE active = 1 AND enabled = 1 AND contactable = 1
               )",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_queue_states(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_state")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn change(subject: &str, category: QueueCategory, score: i32) -> StateChange {
        StateChange {
            subject_id: subject.to_string(),
            category,
            priority_score: score,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_apply_creates_state_and_entry() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let outcome = db.apply_state_change(&change("s-1", QueueCategory::Unsigned, 300)).await.unwrap();
        assert!(outcome.state_created);
        assert!(outcome.entry_created);

        let state = db.get_queue_state("s-1").await.unwrap().unwrap();
        assert_eq!(state.category, Some(QueueCategory::Unsigned));
        assert!(state.active);

        let live = db.live_entries("s-1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].priority, 300);
    }

    #[tokio::test]
    async fn test_transition_leaves_no_stale_entry() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.apply_state_change(&change("s-1", QueueCategory::Unsigned, 300)).await.unwrap();

        let outcome = db.apply_state_change(&change("s-1", QueueCategory::Outstanding, 250)).await.unwrap();
        assert_eq!(outcome.entries_invalidated, 1);
        assert!(outcome.entry_created);

        let live = db.live_entries("s-1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].category, QueueCategory::Outstanding);
    }

    #[tokio::test]
    async fn test_reapply_same_category_reprioritizes_in_place() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.apply_state_change(&change("s-1", QueueCategory::Outstanding, 300)).await.unwrap();
        let outcome = db.apply_state_change(&change("s-1", QueueCategory::Outstanding, 120)).await.unwrap();
        assert!(!outcome.entry_created);
        assert!(outcome.entry_reprioritized);

        let live = db.live_entries("s-1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].priority, 120);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_new_entry() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let now = Utc::now();
        db.set_cooldown("s-1", now + Duration::hours(4), now).await.unwrap();

        let outcome = db.apply_state_change(&change("s-1", QueueCategory::Unsigned, 300)).await.unwrap();
        assert!(!outcome.state_created);
        assert!(outcome.in_cooldown);
        assert!(db.live_entries("s-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_out_of_queues_invalidates_entry() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.apply_state_change(&change("s-1", QueueCategory::Outstanding, 300)).await.unwrap();
        let outcome = db.apply_state_change(&change("s-1", QueueCategory::Ineligible, 300)).await.unwrap();
        assert_eq!(outcome.entries_invalidated, 1);
        assert!(!outcome.entry_created);

        let state = db.get_queue_state("s-1").await.unwrap().unwrap();
        assert!(!state.active);
        assert!(db.live_entries("s-1").await.unwrap().is_empty());
    }
}
