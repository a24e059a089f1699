//! Assignment orchestrator
//!
//! One tick pairs up to `max_items` calls with agents. Inbound callers always
//! go first; the outbound queue is only worked when nobody is holding. Every
//! step is a conditional write, so any number of ticks may run at once and a
//! given call still reaches at most one agent.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gateway::{CallRef, TelephonyGateway};
use super::lifecycle::CallLifecycle;
use crate::agent::{rank_ready_agents, ReadinessValidator, ReadyAgent};
use crate::config::OrchestratorConfig;
use crate::database::agents::reserve_agent_slot;
use crate::database::holding_queue::bind_holding_agent;
use crate::database::queue_entries::assign_entry;
use crate::database::{DatabaseManager, DbHoldingEntry, DbQueueEntry};
use crate::error::Result;
use crate::queue::HoldingQueue;

/// Outbound entries examined per item when the head is contended
const OUTBOUND_LOOKAHEAD: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickParams {
    #[serde(default)]
    pub max_items: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub call: CallRef,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub recovered_claims: u64,
    pub inbound_assigned: u32,
    pub outbound_assigned: u32,
    /// Ring requests the gateway rejected outright
    pub ring_failures: u32,
    /// Calls given up on after the last allowed attempt
    pub abandoned: u32,
    /// The tick stopped because no ready agent was left
    pub no_agent_available: bool,
    pub assignments: Vec<Assignment>,
}

enum Step {
    Assigned,
    /// Work existed but no agent could take it
    NoAgent,
    /// Nothing to work on
    Empty,
    /// Lost a race or the call failed; try the next item
    Skipped,
}

pub struct AssignmentOrchestrator {
    db: DatabaseManager,
    holding: Arc<HoldingQueue>,
    readiness: Arc<ReadinessValidator>,
    lifecycle: Arc<CallLifecycle>,
    gateway: Arc<dyn TelephonyGateway>,
    config: OrchestratorConfig,
}

impl AssignmentOrchestrator {
    pub fn new(
        db: DatabaseManager,
        holding: Arc<HoldingQueue>,
        readiness: Arc<ReadinessValidator>,
        lifecycle: Arc<CallLifecycle>,
        gateway: Arc<dyn TelephonyGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            holding,
            readiness,
            lifecycle,
            gateway,
            config,
        }
    }

    pub async fn tick(&self, params: TickParams) -> Result<TickReport> {
        let mut report = TickReport::default();
        let max_items = params.max_items.unwrap_or(self.config.max_items_per_tick).max(1);

        let stale_after = chrono::Duration::seconds(self.config.stale_claim_timeout_secs as i64);
        report.recovered_claims = self.holding.recover_stale_claims(stale_after).await?;

        for _ in 0..max_items {
            let step = match self.assign_next_inbound(&mut report).await? {
                Step::Empty if self.config.outbound_enabled => self.assign_next_outbound(&mut report).await?,
                step => step,
            };
            match step {
                Step::Assigned | Step::Skipped => continue,
                Step::NoAgent => {
                    report.no_agent_available = true;
                    break;
                }
                Step::Empty => break,
            }
        }

        if !report.assignments.is_empty() {
            info!(
                "🎯 Tick assigned {} inbound / {} outbound call(s)",
                report.inbound_assigned, report.outbound_assigned
            );
        }
        Ok(report)
    }

    async fn assign_next_inbound(&self, report: &mut TickReport) -> Result<Step> {
        let Some(entry) = self.holding.dequeue_next().await? else {
            return Ok(Step::Empty);
        };

        let agent_id = match self.pick_inbound_agent(&entry).await {
            Ok(Some(agent_id)) => agent_id,
            Ok(None) => {
                debug!("No ready agent for call {}, returning it to the queue", entry.call_id);
                self.holding.return_to_waiting(&entry.call_id).await?;
                return Ok(Step::NoAgent);
            }
            Err(e) => {
                // The claim must not outlive this tick
                if let Err(release) = self.holding.return_to_waiting(&entry.call_id).await {
                    warn!("⚠️ Could not return call {} to the queue: {}", entry.call_id, release);
                }
                return Err(e);
            }
        };

        let call = CallRef::Inbound {
            call_id: entry.call_id.clone(),
        };
        if let Err(e) = self.gateway.ring_agent(&agent_id, &call).await {
            warn!("📵 Could not ring agent {} for call {}: {}", agent_id, entry.call_id, e);
            report.ring_failures += 1;
            let effect = self.lifecycle.inbound_failed(&entry.call_id, &agent_id, &e.to_string()).await?;
            if effect == super::LifecycleEffect::Abandoned {
                report.abandoned += 1;
            }
            return Ok(Step::Skipped);
        }

        info!("📞 Call {} → agent {}", entry.call_id, agent_id);
        report.inbound_assigned += 1;
        report.assignments.push(Assignment { call, agent_id });
        Ok(Step::Assigned)
    }

    async fn pick_inbound_agent(&self, entry: &DbHoldingEntry) -> Result<Option<String>> {
        let candidates = rank_ready_agents(self.readiness.ready_agents().await?, &entry.failed_agents);
        if candidates.is_empty() {
            return Ok(None);
        }
        self.bind_inbound(entry, &candidates).await
    }

    /// Bind the claimed entry to the first candidate whose slot can be reserved,
    /// in one transaction per candidate
    async fn bind_inbound(&self, entry: &DbHoldingEntry, candidates: &[ReadyAgent]) -> Result<Option<String>> {
        for candidate in candidates {
            let agent_id = &candidate.agent.agent_id;
            let now = Utc::now();
            let mut tx = self.db.begin_write().await?;

            if !bind_holding_agent(&mut *tx, &entry.call_id, agent_id, now).await? {
                // Someone else bound or abandoned the call
                tx.rollback().await?;
                return Ok(None);
            }
            if !reserve_agent_slot(&mut *tx, agent_id, now).await? {
                tx.rollback().await?;
                self.readiness.cache().invalidate(agent_id);
                debug!("Agent {} was taken before call {} could bind, trying next", agent_id, entry.call_id);
                continue;
            }

            tx.commit().await?;
            self.readiness.cache().invalidate(agent_id);
            return Ok(Some(agent_id.clone()));
        }
        Ok(None)
    }

    async fn assign_next_outbound(&self, report: &mut TickReport) -> Result<Step> {
        let entries = self.db.next_outbound_candidates(Utc::now(), OUTBOUND_LOOKAHEAD).await?;
        if entries.is_empty() {
            return Ok(Step::Empty);
        }

        let ready = self.readiness.ready_agents().await?;
        if ready.is_empty() {
            return Ok(Step::NoAgent);
        }

        for entry in entries {
            let candidates = prefer_target(&entry, rank_ready_agents(ready.clone(), &entry.failed_agents));
            if candidates.is_empty() {
                continue;
            }
            let phone_number = self
                .db
                .load_subject(&entry.subject_id)
                .await?
                .and_then(|subject| subject.phone_number);
            let Some(agent_id) = self.bind_outbound(&entry, &candidates).await? else {
                continue;
            };

            let call = CallRef::Outbound {
                entry_id: entry.entry_id.clone(),
                subject_id: entry.subject_id.clone(),
                phone_number,
            };

            if let Err(e) = self.gateway.ring_agent(&agent_id, &call).await {
                warn!("📵 Could not ring agent {} for {}: {}", agent_id, call, e);
                report.ring_failures += 1;
                self.lifecycle
                    .outbound_failed(&entry.entry_id, Some(&agent_id), &e.to_string())
                    .await?;
                return Ok(Step::Skipped);
            }

            info!("📤 Outbound {} → agent {} (priority {})", call, agent_id, entry.priority);
            report.outbound_assigned += 1;
            report.assignments.push(Assignment { call, agent_id });
            return Ok(Step::Assigned);
        }

        // Every examined entry was taken by a concurrent tick or had no free agent
        Ok(Step::NoAgent)
    }

    async fn bind_outbound(&self, entry: &DbQueueEntry, candidates: &[ReadyAgent]) -> Result<Option<String>> {
        for candidate in candidates {
            let agent_id = &candidate.agent.agent_id;
            let now = Utc::now();
            let mut tx = self.db.begin_write().await?;

            if !assign_entry(&mut *tx, &entry.entry_id, agent_id, now).await? {
                tx.rollback().await?;
                return Ok(None);
            }
            if !reserve_agent_slot(&mut *tx, agent_id, now).await? {
                tx.rollback().await?;
                self.readiness.cache().invalidate(agent_id);
                continue;
            }

            tx.commit().await?;
            self.readiness.cache().invalidate(agent_id);
            return Ok(Some(agent_id.clone()));
        }
        Ok(None)
    }
}

/// Move the entry's target agent (callback routing) to the front, if ready
fn prefer_target(entry: &DbQueueEntry, mut ranked: Vec<ReadyAgent>) -> Vec<ReadyAgent> {
    if let Some(target) = &entry.target_agent_id {
        if let Some(idx) = ranked.iter().position(|a| &a.agent.agent_id == target) {
            let preferred = ranked.remove(idx);
            ranked.insert(0, preferred);
        }
    }
    ranked
}
