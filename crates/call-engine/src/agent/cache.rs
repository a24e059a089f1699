use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::readiness::ReadinessCheck;

/// Short-lived readiness results keyed by agent id.
///
/// The store stays authoritative: entries expire after `ttl` and every write
/// that can change readiness (heartbeat, status, login, sweep) must call
/// [`invalidate`](Self::invalidate).
#[derive(Debug)]
pub struct ReadinessCache {
    entries: DashMap<String, (ReadinessCheck, Instant)>,
    ttl: Duration,
}

impl ReadinessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<ReadinessCheck> {
        let fresh = self
            .entries
            .get(agent_id)
            .filter(|entry| entry.1.elapsed() < self.ttl)
            .map(|entry| entry.0.clone());
        if fresh.is_none() {
            self.entries.remove_if(agent_id, |_, (_, at)| at.elapsed() >= self.ttl);
        }
        fresh
    }

    pub fn insert(&self, agent_id: &str, check: ReadinessCheck) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.insert(agent_id.to_string(), (check, Instant::now()));
    }

    pub fn invalidate(&self, agent_id: &str) {
        self.entries.remove(agent_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
