//! Applies telephony events to holding entries, queue entries, callbacks, agent
//! call counts and subject cooldowns.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::gateway::{CallRef, TelephonyEvent};
use crate::agent::ReadinessValidator;
use crate::config::{OrchestratorConfig, OutcomePolicies};
use crate::database::{DatabaseManager, EntryStatus, HoldingStatus};
use crate::error::{CallCenterError, Result};
use crate::queue::HoldingQueue;
use crate::routing::CallOutcome;

/// What an event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum LifecycleEffect {
    Ignored { reason: String },
    Connected,
    Completed,
    Abandoned,
    /// The agent could not take the call; it is back in line
    Requeued { attempts: u32 },
    OutboundCompleted { cooldown_minutes: i64 },
    OutboundReleased,
}

pub struct CallLifecycle {
    db: DatabaseManager,
    holding: Arc<HoldingQueue>,
    readiness: Arc<ReadinessValidator>,
    outcomes: OutcomePolicies,
    config: OrchestratorConfig,
}

impl CallLifecycle {
    pub fn new(
        db: DatabaseManager,
        holding: Arc<HoldingQueue>,
        readiness: Arc<ReadinessValidator>,
        outcomes: OutcomePolicies,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            holding,
            readiness,
            outcomes,
            config,
        }
    }

    pub async fn handle_event(&self, event: TelephonyEvent) -> Result<LifecycleEffect> {
        debug!("Telephony event: {:?}", event);
        match event {
            TelephonyEvent::CallRinging { call, agent_id } => {
                debug!("🔔 {} ringing at agent {}", call, agent_id);
                Ok(LifecycleEffect::Ignored {
                    reason: "ringing".to_string(),
                })
            }
            TelephonyEvent::CallConnected { call, agent_id } => match call {
                CallRef::Inbound { call_id } => {
                    self.holding.mark_connected(&call_id, &agent_id).await?;
                    Ok(LifecycleEffect::Connected)
                }
                CallRef::Outbound { entry_id, .. } => {
                    info!("🔗 Outbound entry {} connected to agent {}", entry_id, agent_id);
                    Ok(LifecycleEffect::Connected)
                }
            },
            TelephonyEvent::CallEnded {
                call,
                agent_id,
                outcome,
                duration_secs,
            } => match call {
                CallRef::Inbound { call_id } => self.inbound_ended(&call_id, duration_secs).await,
                CallRef::Outbound { entry_id, .. } => {
                    self.outbound_ended(&entry_id, agent_id.as_deref(), outcome).await
                }
            },
            TelephonyEvent::CallFailed { call, agent_id, reason } => match (call, agent_id) {
                (CallRef::Inbound { call_id }, Some(agent_id)) => {
                    self.inbound_failed(&call_id, &agent_id, &reason).await
                }
                (CallRef::Inbound { call_id }, None) => {
                    let abandoned = self.holding.mark_abandoned(&call_id, &format!("failed: {}", reason)).await?;
                    Ok(if abandoned {
                        LifecycleEffect::Abandoned
                    } else {
                        LifecycleEffect::Ignored {
                            reason: "call already finished".to_string(),
                        }
                    })
                }
                (CallRef::Outbound { entry_id, .. }, agent_id) => {
                    self.outbound_failed(&entry_id, agent_id.as_deref(), &reason).await
                }
            },
        }
    }

    async fn inbound_ended(&self, call_id: &str, duration_secs: u32) -> Result<LifecycleEffect> {
        let entry = self.holding.get(call_id).await?;
        match entry.status {
            HoldingStatus::Connected => {
                self.holding.mark_completed(call_id, duration_secs).await?;
                Ok(LifecycleEffect::Completed)
            }
            HoldingStatus::Waiting | HoldingStatus::Assigned => {
                if self.holding.mark_abandoned(call_id, "caller_hangup").await? {
                    Ok(LifecycleEffect::Abandoned)
                } else {
                    Ok(LifecycleEffect::Ignored {
                        reason: "call already finished".to_string(),
                    })
                }
            }
            status => Ok(LifecycleEffect::Ignored {
                reason: format!("call already {}", status),
            }),
        }
    }

    /// The bound agent failed to take an inbound call. After the configured
    /// number of attempts the call is abandoned with an audit record.
    pub async fn inbound_failed(&self, call_id: &str, agent_id: &str, reason: &str) -> Result<LifecycleEffect> {
        let Some(entry) = self.holding.record_failed_attempt(call_id, agent_id).await? else {
            return Ok(LifecycleEffect::Ignored {
                reason: format!("call {} is not assigned to agent {}", call_id, agent_id),
            });
        };

        if entry.attempt_count >= self.config.max_assignment_attempts {
            warn!(
                "🛑 Call {} failed {} time(s), last: {}; giving up",
                call_id, entry.attempt_count, reason
            );
            self.holding
                .mark_abandoned(call_id, &format!("max_attempts_exceeded: {}", reason))
                .await?;
            return Ok(LifecycleEffect::Abandoned);
        }

        Ok(LifecycleEffect::Requeued {
            attempts: entry.attempt_count,
        })
    }

    async fn outbound_ended(
        &self,
        entry_id: &str,
        agent_id: Option<&str>,
        outcome: Option<CallOutcome>,
    ) -> Result<LifecycleEffect> {
        let entry = self
            .db
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| CallCenterError::not_found(format!("queue entry {}", entry_id)))?;
        if entry.status != EntryStatus::Assigned {
            return Ok(LifecycleEffect::Ignored {
                reason: format!("entry already {}", entry.status),
            });
        }

        let now = Utc::now();
        if !self.db.complete_entry(entry_id, now).await? {
            return Ok(LifecycleEffect::Ignored {
                reason: "entry completed concurrently".to_string(),
            });
        }

        let agent = agent_id.map(str::to_string).or(entry.assigned_agent_id.clone());
        if let Some(agent) = &agent {
            self.readiness.release_slot(agent).await?;
        }

        if let Some(callback_id) = &entry.callback_id {
            self.db.complete_callback(callback_id, now).await?;
        }

        let mut cooldown_minutes = 0;
        if let Some(outcome) = outcome {
            self.db.record_contact_attempt(&entry.subject_id, outcome, now).await?;
            cooldown_minutes = self.outcomes.for_outcome(outcome).cooldown_minutes;
            if cooldown_minutes > 0 {
                self.db
                    .set_cooldown(&entry.subject_id, now + Duration::minutes(cooldown_minutes), now)
                    .await?;
            }
        }

        info!(
            "📴 Outbound entry {} for subject {} ended ({:?}, cooldown {}m)",
            entry_id, entry.subject_id, outcome, cooldown_minutes
        );
        Ok(LifecycleEffect::OutboundCompleted { cooldown_minutes })
    }

    /// Put an outbound entry back to PENDING, excluding the failed agent from it, and free the agent
    pub async fn outbound_failed(&self, entry_id: &str, agent_id: Option<&str>, reason: &str) -> Result<LifecycleEffect> {
        let entry = self
            .db
            .get_queue_entry(entry_id)
            .await?
            .ok_or_else(|| CallCenterError::not_found(format!("queue entry {}", entry_id)))?;

        if !self.db.release_entry(entry_id, agent_id, Utc::now()).await? {
            return Ok(LifecycleEffect::Ignored {
                reason: format!("entry already {}", entry.status),
            });
        }
        if let Some(agent) = agent_id.map(str::to_string).or(entry.assigned_agent_id) {
            self.readiness.release_slot(&agent).await?;
        }
        warn!("↩️ Outbound entry {} released: {}", entry_id, reason);
        Ok(LifecycleEffect::OutboundReleased)
    }
}
