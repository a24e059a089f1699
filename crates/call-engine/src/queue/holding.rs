//! Inbound holding queue
//!
//! Callers wait here until an agent frees up. Ordering is total:
//! `(priority asc, entered_at asc, arrival_seq asc)`. Every WAITING entry carries
//! its current position and an estimated wait, rewritten whenever the set of
//! waiting callers changes.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::ReadinessValidator;
use crate::config::QueueConfig;
use crate::database::holding_queue::{count_live_holding, fetch_holding_entry, insert_holding_entry, reorder_waiting};
use crate::database::{DatabaseManager, DbHoldingEntry, NewHoldingEntry};
use crate::error::{CallCenterError, Result};

/// How many times `dequeue_next` retries after losing a claim race
const MAX_CLAIM_RACES: usize = 5;

/// An inbound call arriving from the telephony side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundCall {
    pub call_id: String,
    #[serde(default)]
    pub caller_number: Option<String>,
    /// Explicit priority; defaults to the configured inbound base
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub call_id: String,
    pub subject_id: Option<String>,
    pub priority: i32,
    pub position: u32,
    pub estimated_wait_seconds: u32,
}

/// `position / max(1, ready agents) × average call duration`, clamped
pub fn estimate_wait_secs(position: u32, ready_agents: usize, avg_call_secs: f64, min_secs: u32, max_secs: u32) -> u32 {
    let per_agent = position as f64 / ready_agents.max(1) as f64;
    let raw = (per_agent * avg_call_secs).round();
    let raw = if raw.is_finite() && raw > 0.0 { raw.min(u32::MAX as f64) as u32 } else { 0 };
    raw.clamp(min_secs, max_secs.max(min_secs))
}

#[derive(Debug, Clone, Copy)]
struct WaitEstimator {
    ready_agents: usize,
    avg_call_secs: f64,
    min_secs: u32,
    max_secs: u32,
}

impl WaitEstimator {
    fn estimate(&self, position: u32) -> u32 {
        estimate_wait_secs(position, self.ready_agents, self.avg_call_secs, self.min_secs, self.max_secs)
    }
}

pub struct HoldingQueue {
    db: DatabaseManager,
    readiness: Arc<ReadinessValidator>,
    config: QueueConfig,
}

impl HoldingQueue {
    pub fn new(db: DatabaseManager, readiness: Arc<ReadinessValidator>, config: QueueConfig) -> Self {
        Self { db, readiness, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Wait estimator for the current agent pool, evaluated once per reorder
    async fn wait_estimator(&self) -> Result<WaitEstimator> {
        let ready_agents = self.readiness.ready_agent_count().await?;
        let avg_call_secs = self
            .db
            .average_recent_call_duration(self.config.recent_call_sample)
            .await?
            .unwrap_or(self.config.default_call_duration_secs as f64);
        Ok(WaitEstimator {
            ready_agents,
            avg_call_secs,
            min_secs: self.config.min_wait_estimate_secs,
            max_secs: self.config.max_wait_estimate_secs,
        })
    }

    /// Place a caller on hold and return their post-reorder position
    pub async fn enqueue(&self, call: InboundCall) -> Result<EnqueueResult> {
        if call.call_id.trim().is_empty() {
            return Err(CallCenterError::invalid_input("call_id must not be empty"));
        }

        let subject_id = match call.caller_number.as_deref() {
            Some(number) if !number.is_empty() => self.db.subject_id_for_phone(number).await?,
            _ => None,
        };
        let mut priority = call.priority.unwrap_or(self.config.inbound_base_priority);
        if subject_id.is_some() {
            priority = priority.saturating_sub(self.config.known_subject_bonus);
        }

        let estimate = self.wait_estimator().await?;
        let now = Utc::now();
        let mut tx = self.db.begin_write().await?;

        if fetch_holding_entry(&mut *tx, &call.call_id).await?.is_some() {
            return Err(CallCenterError::AlreadyExists(format!("call {} is already queued", call.call_id)));
        }
        let live = count_live_holding(&mut *tx).await?;
        if live >= self.config.holding_capacity as u64 {
            warn!("🚫 Holding queue full ({} live), rejecting call {}", live, call.call_id);
            return Err(CallCenterError::queue_full(format!(
                "holding queue at capacity ({})",
                self.config.holding_capacity
            )));
        }

        insert_holding_entry(
            &mut *tx,
            &NewHoldingEntry {
                call_id: call.call_id.clone(),
                caller_number: call.caller_number.clone(),
                subject_id: subject_id.clone(),
                priority,
            },
            now,
        )
        .await?;
        reorder_waiting(&mut *tx, |position| estimate.estimate(position), now).await?;

        let entry = fetch_holding_entry(&mut *tx, &call.call_id)
            .await?
            .ok_or_else(|| CallCenterError::internal(format!("call {} vanished after enqueue", call.call_id)))?;
        tx.commit().await?;

        info!(
            "📞 Enqueued call {} (priority {}, position {}, ~{}s)",
            entry.call_id, entry.priority, entry.position, entry.estimated_wait_secs
        );
        Ok(EnqueueResult {
            call_id: entry.call_id,
            subject_id,
            priority,
            position: entry.position,
            estimated_wait_seconds: entry.estimated_wait_secs,
        })
    }

    /// Claim the head of the queue (WAITING → ASSIGNED, no agent bound yet)
    pub async fn dequeue_next(&self) -> Result<Option<DbHoldingEntry>> {
        for _ in 0..MAX_CLAIM_RACES {
            let Some(call_id) = self.db.best_waiting_call_id().await? else {
                return Ok(None);
            };
            if self.db.claim_waiting(&call_id, Utc::now()).await? {
                self.refresh_after_change(&call_id).await;
                debug!("📤 Claimed call {} from the holding queue", call_id);
                return match self.db.get_holding_entry(&call_id).await {
                    Ok(entry) => Ok(entry),
                    Err(e) => {
                        if let Err(release) = self.return_to_waiting(&call_id).await {
                            warn!("⚠️ Could not release claim on call {}: {}", call_id, release);
                        }
                        Err(e)
                    }
                };
            }
            debug!("Lost claim race for call {}, retrying", call_id);
        }
        Ok(None)
    }

    /// Recompute positions and wait estimates for every WAITING entry
    pub async fn update_positions(&self) -> Result<u32> {
        let estimate = self.wait_estimator().await?;
        let mut tx = self.db.begin_write().await?;
        let waiting = reorder_waiting(&mut *tx, |position| estimate.estimate(position), Utc::now()).await?;
        tx.commit().await?;
        Ok(waiting)
    }

    /// Positions are recomputed on every queue change, so a refresh that fails
    /// after a committed transition is logged and left to the next one
    async fn refresh_after_change(&self, call_id: &str) {
        if let Err(e) = self.update_positions().await {
            warn!("⚠️ Positions not refreshed after change to call {}: {}", call_id, e);
        }
    }

    /// Recompute and return one caller's position
    pub async fn refresh_position(&self, call_id: &str) -> Result<DbHoldingEntry> {
        self.update_positions().await?;
        self.get(call_id).await
    }

    pub async fn get(&self, call_id: &str) -> Result<DbHoldingEntry> {
        self.db
            .get_holding_entry(call_id)
            .await?
            .ok_or_else(|| CallCenterError::not_found(format!("call {}", call_id)))
    }

    pub async fn waiting(&self) -> Result<Vec<DbHoldingEntry>> {
        self.db.waiting_entries().await
    }

    pub async fn mark_connected(&self, call_id: &str, agent_id: &str) -> Result<()> {
        if !self.db.mark_holding_connected(call_id, agent_id, Utc::now()).await? {
            return Err(CallCenterError::conflict(format!(
                "call {} is not assigned to agent {}",
                call_id, agent_id
            )));
        }
        info!("🔗 Call {} connected to agent {}", call_id, agent_id);
        Ok(())
    }

    /// Terminal abandonment with a missed-contact record. Frees the bound
    /// agent's slot, if any. Returns false if the call was already past waiting.
    pub async fn mark_abandoned(&self, call_id: &str, reason: &str) -> Result<bool> {
        let Some(entry) = self.db.abandon_holding_entry(call_id, reason, Utc::now()).await? else {
            return Ok(false);
        };
        if let Some(agent_id) = &entry.assigned_agent_id {
            self.readiness.release_slot(agent_id).await?;
        }
        self.update_positions().await?;
        info!("📵 Call {} abandoned ({}) after {} attempt(s)", call_id, reason, entry.attempt_count);
        Ok(true)
    }

    /// CONNECTED → COMPLETED; the agent's slot is returned
    pub async fn mark_completed(&self, call_id: &str, duration_secs: u32) -> Result<()> {
        let entry = self.get(call_id).await?;
        if !self.db.mark_holding_completed(call_id, duration_secs, Utc::now()).await? {
            return Err(CallCenterError::conflict(format!(
                "call {} is {} and cannot complete",
                call_id, entry.status
            )));
        }
        if let Some(agent_id) = &entry.assigned_agent_id {
            self.readiness.release_slot(agent_id).await?;
        }
        info!("✅ Call {} completed after {}s", call_id, duration_secs);
        Ok(())
    }

    /// Put a claimed-but-unbound entry back in line
    pub async fn return_to_waiting(&self, call_id: &str) -> Result<bool> {
        let returned = self.db.return_to_waiting(call_id, Utc::now()).await?;
        if returned {
            self.refresh_after_change(call_id).await;
        }
        Ok(returned)
    }

    /// The bound agent could not take the call: remember them, free their slot,
    /// and send the call back to WAITING.
    pub async fn record_failed_attempt(&self, call_id: &str, agent_id: &str) -> Result<Option<DbHoldingEntry>> {
        let entry = self.db.record_failed_attempt(call_id, agent_id, Utc::now()).await?;
        if entry.is_some() {
            self.readiness.release_slot(agent_id).await?;
            self.update_positions().await?;
            warn!("↩️ Agent {} failed to take call {}, back to waiting", agent_id, call_id);
        }
        Ok(entry)
    }

    /// Claims whose tick died before binding an agent
    pub async fn recover_stale_claims(&self, older_than: chrono::Duration) -> Result<u64> {
        let now = Utc::now();
        let recovered = self.db.recover_stale_claims(now - older_than, now).await?;
        if recovered > 0 {
            warn!("♻️ Recovered {} stale holding claim(s)", recovered);
            self.update_positions().await?;
        }
        Ok(recovered)
    }

    pub async fn purge_terminal(&self, retention: chrono::Duration) -> Result<u64> {
        let purged = self.db.purge_terminal_holding(Utc::now() - retention).await?;
        if purged > 0 {
            info!("🧹 Purged {} terminal holding entries", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::database::HoldingStatus;

    async fn setup(capacity: u32) -> (DatabaseManager, HoldingQueue) {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let readiness = Arc::new(ReadinessValidator::new(db.clone(), AgentConfig::default()));
        let config = QueueConfig {
            holding_capacity: capacity,
            ..Default::default()
        };
        (db.clone(), HoldingQueue::new(db, readiness, config))
    }

    fn call(id: &str, priority: i32) -> InboundCall {
        InboundCall {
            call_id: id.to_string(),
            caller_number: None,
            priority: Some(priority),
        }
    }

    #[test]
    fn test_wait_estimate_is_clamped() {
        assert_eq!(estimate_wait_secs(1, 0, 180.0, 30, 600), 180);
        assert_eq!(estimate_wait_secs(1, 10, 180.0, 30, 600), 30);
        assert_eq!(estimate_wait_secs(50, 1, 180.0, 30, 600), 600);
        assert_eq!(estimate_wait_secs(3, 2, 100.0, 30, 600), 150);
    }

    #[tokio::test]
    async fn test_equal_priority_goes_behind_earlier_callers() {
        let (_db, queue) = setup(100).await;
        queue.enqueue(call("a", 10)).await.unwrap();
        queue.enqueue(call("b", 10)).await.unwrap();
        queue.enqueue(call("c", 40)).await.unwrap();

        let result = queue.enqueue(call("d", 10)).await.unwrap();
        assert_eq!(result.position, 3);

        let order: Vec<(String, u32)> = queue
            .waiting()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.call_id, e.position))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 2),
                ("d".to_string(), 3),
                ("c".to_string(), 4)
            ]
        );
        // No ready agents, default 180s calls: position × 180 clamped to 600
        assert_eq!(queue.get("c").await.unwrap().estimated_wait_secs, 600);
        assert_eq!(queue.get("a").await.unwrap().estimated_wait_secs, 180);
    }

    #[tokio::test]
    async fn test_capacity_and_duplicates_are_rejected() {
        let (_db, queue) = setup(2).await;
        queue.enqueue(call("a", 10)).await.unwrap();
        assert!(matches!(
            queue.enqueue(call("a", 10)).await,
            Err(CallCenterError::AlreadyExists(_))
        ));
        queue.enqueue(call("b", 10)).await.unwrap();
        assert!(matches!(queue.enqueue(call("c", 10)).await, Err(CallCenterError::QueueFull(_))));

        // ASSIGNED still counts against capacity
        queue.dequeue_next().await.unwrap().unwrap();
        assert!(matches!(queue.enqueue(call("c", 10)).await, Err(CallCenterError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_dequeue_takes_most_urgent_and_reorders() {
        let (_db, queue) = setup(100).await;
        queue.enqueue(call("slow", 50)).await.unwrap();
        queue.enqueue(call("urgent", 5)).await.unwrap();

        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.call_id, "urgent");
        assert_eq!(claimed.status, HoldingStatus::Assigned);
        assert!(claimed.assigned_agent_id.is_none());
        assert_eq!(queue.get("slow").await.unwrap().position, 1);

        assert!(queue.return_to_waiting("urgent").await.unwrap());
        assert_eq!(queue.get("urgent").await.unwrap().position, 1);
        assert_eq!(queue.get("slow").await.unwrap().position, 2);
    }

    #[tokio::test]
    async fn test_abandon_is_terminal_and_recorded() {
        let (db, queue) = setup(100).await;
        queue.enqueue(call("a", 10)).await.unwrap();
        queue.enqueue(call("b", 20)).await.unwrap();

        assert!(queue.mark_abandoned("a", "caller_hangup").await.unwrap());
        assert!(!queue.mark_abandoned("a", "caller_hangup").await.unwrap());
        assert_eq!(queue.get("a").await.unwrap().status, HoldingStatus::Abandoned);
        assert_eq!(queue.get("b").await.unwrap().position, 1);
        assert!(db.get_missed_contact("a").await.unwrap().is_some());

        assert_eq!(queue.purge_terminal(chrono::Duration::seconds(-1)).await.unwrap(), 1);
        assert!(matches!(queue.get("a").await, Err(CallCenterError::NotFound(_))));
        // The audit record outlives the holding entry
        assert!(db.get_missed_contact("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_claims_return_to_waiting() {
        let (_db, queue) = setup(100).await;
        queue.enqueue(call("a", 10)).await.unwrap();
        queue.dequeue_next().await.unwrap().unwrap();

        assert_eq!(queue.recover_stale_claims(chrono::Duration::seconds(60)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale_claims(chrono::Duration::seconds(-1)).await.unwrap(), 1);
        assert_eq!(queue.get("a").await.unwrap().status, HoldingStatus::Waiting);
    }
}
