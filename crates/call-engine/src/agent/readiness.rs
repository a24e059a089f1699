//! Agent readiness: session, activity, heartbeat, status, device and capacity
//! checks rolled into one verdict with a 0-100 score.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::ReadinessCache;
use crate::config::AgentConfig;
use crate::database::{AgentStatus, DatabaseManager, DbAgent};
use crate::error::{CallCenterError, Result};

/// Points awarded for a heartbeat received right now; decays linearly to zero
/// at the heartbeat timeout.
const HEARTBEAT_POINTS: f64 = 60.0;
const DEVICE_POINTS: u8 = 40;
const HIGH_TIER_SCORE: u8 = 90;

/// First failed check, in evaluation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum NotReadyReason {
    UnknownAgent,
    NoSession,
    Inactive,
    HeartbeatExpired,
    NotAvailable(AgentStatus),
    DeviceDisconnected,
    AtCapacity,
    BelowThreshold,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotReadyReason::UnknownAgent => write!(f, "unknown agent"),
            NotReadyReason::NoSession => write!(f, "no active session"),
            NotReadyReason::Inactive => write!(f, "agent deactivated"),
            NotReadyReason::HeartbeatExpired => write!(f, "heartbeat expired"),
            NotReadyReason::NotAvailable(status) => write!(f, "status is {}", status),
            NotReadyReason::DeviceDisconnected => write!(f, "device disconnected"),
            NotReadyReason::AtCapacity => write!(f, "at call capacity"),
            NotReadyReason::BelowThreshold => write!(f, "readiness score below threshold"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessCheck {
    pub agent_id: String,
    pub ready: bool,
    pub reason: Option<NotReadyReason>,
    pub readiness_score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReadinessTier {
    Low,
    Medium,
    High,
}

impl ReadinessCheck {
    fn not_ready(agent_id: &str, reason: NotReadyReason, score: u8) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ready: false,
            reason: Some(reason),
            readiness_score: score,
        }
    }

    pub fn tier(&self, threshold: u8) -> ReadinessTier {
        if self.readiness_score >= HIGH_TIER_SCORE {
            ReadinessTier::High
        } else if self.readiness_score >= threshold {
            ReadinessTier::Medium
        } else {
            ReadinessTier::Low
        }
    }
}

/// A ready agent together with the row it was judged from
#[derive(Debug, Clone, Serialize)]
pub struct ReadyAgent {
    pub agent: DbAgent,
    pub check: ReadinessCheck,
    pub tier: ReadinessTier,
}

/// Heartbeat recency (60) plus device connectivity (40)
pub fn readiness_score(agent: &DbAgent, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> u8 {
    let heartbeat = match agent.last_heartbeat {
        Some(at) if heartbeat_timeout > chrono::Duration::zero() => {
            let age = (now - at).num_milliseconds().max(0) as f64;
            let window = heartbeat_timeout.num_milliseconds() as f64;
            (HEARTBEAT_POINTS * (1.0 - age / window)).clamp(0.0, HEARTBEAT_POINTS).round() as u8
        }
        _ => 0,
    };
    let device = if agent.device_connected { DEVICE_POINTS } else { 0 };
    heartbeat + device
}

/// Evaluate readiness from a row, short-circuiting on the first failed check
pub fn evaluate(agent: &DbAgent, now: DateTime<Utc>, config: &AgentConfig) -> ReadinessCheck {
    let timeout = config.heartbeat_timeout();
    let score = readiness_score(agent, now, timeout);
    let id = agent.agent_id.as_str();

    if !agent.has_session() {
        return ReadinessCheck::not_ready(id, NotReadyReason::NoSession, score);
    }
    if !agent.active {
        return ReadinessCheck::not_ready(id, NotReadyReason::Inactive, score);
    }
    let heartbeat_fresh = agent.last_heartbeat.map_or(false, |at| now - at <= timeout);
    if !heartbeat_fresh {
        return ReadinessCheck::not_ready(id, NotReadyReason::HeartbeatExpired, score);
    }
    if agent.status != AgentStatus::Available {
        return ReadinessCheck::not_ready(id, NotReadyReason::NotAvailable(agent.status), score);
    }
    if !agent.device_connected {
        return ReadinessCheck::not_ready(id, NotReadyReason::DeviceDisconnected, score);
    }
    if !agent.has_capacity() {
        return ReadinessCheck::not_ready(id, NotReadyReason::AtCapacity, score);
    }
    if score < config.readiness_threshold {
        return ReadinessCheck::not_ready(id, NotReadyReason::BelowThreshold, score);
    }

    ReadinessCheck {
        agent_id: agent.agent_id.clone(),
        ready: true,
        reason: None,
        readiness_score: score,
    }
}

/// Derives agent readiness from the store and owns every write that can change it
pub struct ReadinessValidator {
    db: DatabaseManager,
    config: AgentConfig,
    cache: ReadinessCache,
}

impl ReadinessValidator {
    pub fn new(db: DatabaseManager, config: AgentConfig) -> Self {
        let cache = ReadinessCache::new(config.readiness_cache_ttl());
        Self { db, config, cache }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn cache(&self) -> &ReadinessCache {
        &self.cache
    }

    /// Readiness of a single agent, served from the cache when fresh
    pub async fn is_ready(&self, agent_id: &str) -> Result<ReadinessCheck> {
        if let Some(check) = self.cache.get(agent_id) {
            return Ok(check);
        }

        let check = match self.db.get_agent(agent_id).await? {
            Some(agent) => evaluate(&agent, Utc::now(), &self.config),
            None => ReadinessCheck::not_ready(agent_id, NotReadyReason::UnknownAgent, 0),
        };
        self.cache.insert(agent_id, check.clone());
        Ok(check)
    }

    /// Agents that pass every check and are also alive by the independent
    /// heartbeat-only query. Always reads the store.
    pub async fn ready_agents(&self) -> Result<Vec<ReadyAgent>> {
        let now = Utc::now();
        let candidates = self.db.agents_with_session().await?;
        let alive = self
            .db
            .heartbeat_alive_agent_ids(now - self.config.heartbeat_timeout())
            .await?;

        let mut ready = Vec::new();
        for agent in candidates {
            let check = evaluate(&agent, now, &self.config);
            self.cache.insert(&agent.agent_id, check.clone());
            if !check.ready {
                continue;
            }
            if !alive.contains(&agent.agent_id) {
                warn!(
                    "⚠️ Agent {} passed readiness but is missing from the heartbeat query, skipping",
                    agent.agent_id
                );
                continue;
            }
            let tier = check.tier(self.config.readiness_threshold);
            ready.push(ReadyAgent { agent, check, tier });
        }

        debug!("{} ready agent(s)", ready.len());
        Ok(ready)
    }

    pub async fn ready_agent_count(&self) -> Result<usize> {
        Ok(self.ready_agents().await?.len())
    }

    /// Log out every agent whose heartbeat has expired
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let swept = self
            .db
            .sweep_expired_heartbeats(now - self.config.heartbeat_timeout(), now)
            .await?;
        for agent_id in &swept {
            self.cache.invalidate(agent_id);
            info!("💤 Agent {} heartbeat expired, marked OFFLINE", agent_id);
        }
        Ok(swept)
    }

    pub async fn register_agent(&self, agent_id: &str, display_name: &str, max_concurrent_calls: Option<u32>) -> Result<()> {
        if agent_id.trim().is_empty() {
            return Err(CallCenterError::invalid_input("agent_id must not be empty"));
        }
        let max_calls = max_concurrent_calls.unwrap_or(self.config.default_max_concurrent_calls);
        self.db.register_agent(agent_id, display_name, max_calls).await?;
        self.cache.invalidate(agent_id);
        Ok(())
    }

    pub async fn login(&self, agent_id: &str, session_id: &str, device_connected: bool) -> Result<()> {
        let applied = self.db.login_agent(agent_id, session_id, device_connected, Utc::now()).await?;
        self.cache.invalidate(agent_id);
        if !applied {
            return Err(CallCenterError::not_found(format!("active agent {}", agent_id)));
        }
        info!("✅ Agent {} logged in (session {})", agent_id, session_id);
        Ok(())
    }

    pub async fn logout(&self, agent_id: &str) -> Result<bool> {
        let applied = self.db.logout_agent(agent_id, Utc::now()).await?;
        self.cache.invalidate(agent_id);
        if applied {
            info!("👋 Agent {} logged out", agent_id);
        }
        Ok(applied)
    }

    pub async fn record_heartbeat(&self, agent_id: &str, device_connected: Option<bool>) -> Result<()> {
        let applied = self.db.record_heartbeat(agent_id, device_connected, Utc::now()).await?;
        self.cache.invalidate(agent_id);
        if !applied {
            return Err(CallCenterError::not_found(format!("logged-in agent {}", agent_id)));
        }
        Ok(())
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        let applied = self.db.set_agent_status(agent_id, status, Utc::now()).await?;
        self.cache.invalidate(agent_id);
        if !applied {
            return Err(CallCenterError::not_found(format!("logged-in agent {}", agent_id)));
        }
        Ok(())
    }

    /// Give a call slot back and drop any cached verdict
    pub async fn release_slot(&self, agent_id: &str) -> Result<bool> {
        let released = self.db.release_agent(agent_id, Utc::now()).await?;
        self.cache.invalidate(agent_id);
        Ok(released)
    }
}

/// Shared handle used across workers
pub type SharedReadinessValidator = Arc<ReadinessValidator>;

/// Order ready agents for an assignment: tier desc, score desc, fewest current
/// calls, longest idle. Agents in `excluded` or without a free slot are dropped.
pub fn rank_ready_agents(mut agents: Vec<ReadyAgent>, excluded: &[String]) -> Vec<ReadyAgent> {
    agents.retain(|a| a.agent.has_capacity() && !excluded.iter().any(|id| id == &a.agent.agent_id));
    agents.sort_by(|a, b| {
        b.tier
            .cmp(&a.tier)
            .then(b.check.readiness_score.cmp(&a.check.readiness_score))
            .then(a.agent.current_calls.cmp(&b.agent.current_calls))
            .then_with(|| match (a.agent.available_since, b.agent.available_since) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.agent.agent_id.cmp(&b.agent.agent_id))
    });
    agents
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent(now: DateTime<Utc>) -> DbAgent {
        DbAgent {
            agent_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            active: true,
            status: AgentStatus::Available,
            session_id: Some("s".to_string()),
            logged_in_at: Some(now),
            logged_out_at: None,
            last_heartbeat: Some(now),
            last_activity_at: Some(now),
            device_connected: true,
            max_concurrent_calls: 1,
            current_calls: 0,
            available_since: Some(now),
        }
    }

    #[test]
    fn test_fresh_connected_agent_is_ready_with_full_score() {
        let now = Utc::now();
        let check = evaluate(&agent(now), now, &AgentConfig::default());
        assert!(check.ready);
        assert_eq!(check.readiness_score, 100);
        assert_eq!(check.tier(70), ReadinessTier::High);
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        let now = Utc::now();
        let config = AgentConfig::default();

        let mut a = agent(now);
        a.session_id = None;
        a.active = false;
        assert_eq!(evaluate(&a, now, &config).reason, Some(NotReadyReason::NoSession));

        let mut a = agent(now);
        a.active = false;
        a.last_heartbeat = None;
        assert_eq!(evaluate(&a, now, &config).reason, Some(NotReadyReason::Inactive));

        let mut a = agent(now);
        a.last_heartbeat = Some(now - Duration::seconds(91));
        a.status = AgentStatus::Break;
        assert_eq!(evaluate(&a, now, &config).reason, Some(NotReadyReason::HeartbeatExpired));

        let mut a = agent(now);
        a.status = AgentStatus::Break;
        assert_eq!(
            evaluate(&a, now, &config).reason,
            Some(NotReadyReason::NotAvailable(AgentStatus::Break))
        );

        let mut a = agent(now);
        a.device_connected = false;
        assert_eq!(evaluate(&a, now, &config).reason, Some(NotReadyReason::DeviceDisconnected));

        let mut a = agent(now);
        a.current_calls = 1;
        assert_eq!(evaluate(&a, now, &config).reason, Some(NotReadyReason::AtCapacity));
    }

    #[test]
    fn test_score_decays_with_heartbeat_age() {
        let now = Utc::now();
        let config = AgentConfig::default();
        let timeout = config.heartbeat_timeout();

        let mut a = agent(now);
        a.last_heartbeat = Some(now - timeout / 2);
        assert_eq!(readiness_score(&a, now, timeout), 70);
        assert!(evaluate(&a, now, &config).ready);

        a.last_heartbeat = Some(now - Duration::seconds(60));
        let check = evaluate(&a, now, &config);
        assert_eq!(check.readiness_score, 60);
        assert_eq!(check.reason, Some(NotReadyReason::BelowThreshold));
    }

    #[test]
    fn test_ranking_prefers_tier_then_idle_time() {
        let now = Utc::now();
        let config = AgentConfig::default();
        let ready = |id: &str, heartbeat_age: i64, idle_secs: i64| {
            let mut a = agent(now);
            a.agent_id = id.to_string();
            a.last_heartbeat = Some(now - Duration::seconds(heartbeat_age));
            a.available_since = Some(now - Duration::seconds(idle_secs));
            let check = evaluate(&a, now, &config);
            let tier = check.tier(config.readiness_threshold);
            ReadyAgent { agent: a, check, tier }
        };

        let ranked = rank_ready_agents(
            vec![ready("stale", 40, 500), ready("fresh-short", 0, 10), ready("fresh-long", 0, 300)],
            &[],
        );
        let order: Vec<&str> = ranked.iter().map(|r| r.agent.agent_id.as_str()).collect();
        assert_eq!(order, vec!["fresh-long", "fresh-short", "stale"]);

        let ranked = rank_ready_agents(vec![ready("a", 0, 10), ready("b", 0, 5)], &["a".to_string()]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].agent.agent_id, "b");
    }

    #[tokio::test]
    async fn test_ready_agents_and_cache_invalidation() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let validator = ReadinessValidator::new(db.clone(), AgentConfig::default());

        validator.register_agent("alice", "Alice", None).await.unwrap();
        validator.register_agent("bob", "Bob", None).await.unwrap();
        validator.login("alice", "s-1", true).await.unwrap();
        validator.login("bob", "s-2", false).await.unwrap();

        let ready = validator.ready_agents().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].agent.agent_id, "alice");

        assert!(!validator.is_ready("bob").await.unwrap().ready);
        validator.record_heartbeat("bob", Some(true)).await.unwrap();
        assert!(validator.is_ready("bob").await.unwrap().ready);

        validator.set_status("bob", AgentStatus::Break).await.unwrap();
        assert_eq!(
            validator.is_ready("bob").await.unwrap().reason,
            Some(NotReadyReason::NotAvailable(AgentStatus::Break))
        );

        let unknown = validator.is_ready("nobody").await.unwrap();
        assert_eq!(unknown.reason, Some(NotReadyReason::UnknownAgent));
        assert!(validator.record_heartbeat("nobody", None).await.is_err());
    }
}
