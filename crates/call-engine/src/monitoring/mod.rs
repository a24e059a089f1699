//! # Call Monitoring Module
//!
//! Point-in-time statistics for the call engine, read straight from the store.
//! Nothing here is accumulated in memory, so any number of engine instances
//! pointed at one database report the same numbers.
//!
//! ```text
//! holding_queue ──┐
//! queue_entries ──┤
//! agents ─────────┼──► CallCenterStats ──► GET /api/v1/stats
//! callbacks ──────┤
//! missed_contacts ┤
//! reconciliation ─┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::agent::ReadinessValidator;
use crate::config::DatabaseConfig;
use crate::database::{retry_read, DatabaseManager, DbReconciliationRun};
use crate::error::Result;

/// Inbound holding queue figures
#[derive(Debug, Clone, Default, Serialize)]
pub struct HoldingStats {
    /// Entry count per status
    pub by_status: BTreeMap<String, u64>,
    pub waiting: u64,
    /// Seconds the longest-waiting caller has been on hold
    pub longest_wait_secs: Option<i64>,
}

/// Outbound queue figures
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundStats {
    /// Live entry count keyed by `CATEGORY/STATUS`
    pub live: BTreeMap<String, u64>,
    pub queue_states: u64,
    /// `(subject, category)` pairs with more than one live entry. Always empty
    /// unless the store has been corrupted.
    pub duplicates: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub by_status: BTreeMap<String, u64>,
    pub ready: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallbackStats {
    pub pending: u64,
    pub accepted: u64,
}

/// Engine snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CallCenterStats {
    pub instance_name: String,
    pub collected_at: DateTime<Utc>,
    pub holding: HoldingStats,
    pub outbound: OutboundStats,
    pub agents: AgentStats,
    pub callbacks: CallbackStats,
    pub missed_last_24h: u64,
    pub last_reconciliation: Option<DbReconciliationRun>,
}

impl CallCenterStats {
    /// Busy share of agents that are not offline
    pub fn agent_utilization(&self) -> f32 {
        let on_call = self.agents.by_status.get("ON_CALL").copied().unwrap_or(0);
        let available = self.agents.by_status.get("AVAILABLE").copied().unwrap_or(0);
        let total = on_call + available;
        if total > 0 {
            on_call as f32 / total as f32
        } else {
            0.0
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.outbound.duplicates.is_empty()
    }
}

/// Gathers [`CallCenterStats`]; every read is idempotent and retried on
/// transient failures
pub struct StatsCollector {
    db: DatabaseManager,
    attempts: u32,
    base_delay: Duration,
}

impl StatsCollector {
    pub fn new(db: DatabaseManager, config: &DatabaseConfig) -> Self {
        Self {
            db,
            attempts: config.read_retry_attempts,
            base_delay: Duration::from_millis(config.read_retry_base_delay_ms),
        }
    }

    pub async fn collect(&self, instance_name: &str, readiness: &ReadinessValidator) -> Result<CallCenterStats> {
        let now = Utc::now();
        let db = &self.db;
        let (attempts, delay) = (self.attempts, self.base_delay);

        let mut holding = HoldingStats::default();
        for (status, count) in retry_read(attempts, delay, || db.holding_status_counts()).await? {
            holding.by_status.insert(status.to_string(), count);
        }
        holding.waiting = holding.by_status.get("WAITING").copied().unwrap_or(0);
        holding.longest_wait_secs = retry_read(attempts, delay, || db.oldest_waiting_since())
            .await?
            .map(|since| (now - since).num_seconds().max(0));

        let mut outbound = OutboundStats::default();
        for (category, status, count) in retry_read(attempts, delay, || db.live_entry_counts()).await? {
            outbound.live.insert(format!("{}/{}", category, status), count);
        }
        outbound.queue_states = retry_read(attempts, delay, || db.count_queue_states()).await?;
        outbound.duplicates = retry_read(attempts, delay, || db.duplicate_live_entries()).await?;
        if !outbound.duplicates.is_empty() {
            warn!("⚠️ {} subject(s) hold duplicate live queue entries", outbound.duplicates.len());
        }

        let mut agents = AgentStats::default();
        for (status, count) in retry_read(attempts, delay, || db.agent_status_counts()).await? {
            agents.by_status.insert(status.to_string(), count);
        }
        agents.ready = readiness.ready_agent_count().await?;

        let (pending, accepted) = retry_read(attempts, delay, || db.count_open_callbacks()).await?;
        let since = now - chrono::Duration::hours(24);
        let missed_last_24h = retry_read(attempts, delay, || db.count_missed_since(since)).await?;
        let last_reconciliation = retry_read(attempts, delay, || db.latest_reconciliation_run()).await?;

        Ok(CallCenterStats {
            instance_name: instance_name.to_string(),
            collected_at: now,
            holding,
            outbound,
            agents,
            callbacks: CallbackStats { pending, accepted },
            missed_last_24h,
            last_reconciliation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::database::NewCallback;

    #[tokio::test]
    async fn test_empty_snapshot() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let readiness = ReadinessValidator::new(db.clone(), AgentConfig::default());
        let stats = StatsCollector::new(db, &DatabaseConfig::default())
            .collect("test", &readiness)
            .await
            .unwrap();

        assert_eq!(stats.holding.waiting, 0);
        assert!(stats.holding.longest_wait_secs.is_none());
        assert_eq!(stats.agents.ready, 0);
        assert!(stats.last_reconciliation.is_none());
        assert!(stats.is_consistent());
        assert_eq!(stats.agent_utilization(), 0.0);
    }

    #[tokio::test]
    async fn test_counts_agents_and_callbacks() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let now = Utc::now();
        db.register_agent("alice", "Alice", 1).await.unwrap();
        db.register_agent("bob", "Bob", 1).await.unwrap();
        db.login_agent("alice", "s-1", true, now).await.unwrap();
        db.insert_callback(
            &NewCallback {
                subject_id: "s-1".to_string(),
                scheduled_for: now,
                reason: "asked".to_string(),
                preferred_agent_id: None,
                origin_call_id: None,
            },
            now,
        )
        .await
        .unwrap();

        let readiness = ReadinessValidator::new(db.clone(), AgentConfig::default());
        let stats = StatsCollector::new(db, &DatabaseConfig::default())
            .collect("test", &readiness)
            .await
            .unwrap();

        assert_eq!(stats.agents.by_status.get("AVAILABLE"), Some(&1));
        assert_eq!(stats.agents.by_status.get("OFFLINE"), Some(&1));
        assert_eq!(stats.agents.ready, 1);
        assert_eq!(stats.callbacks.pending, 1);
    }
}
