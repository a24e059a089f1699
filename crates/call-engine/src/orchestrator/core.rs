use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::assignment::{AssignmentOrchestrator, TickParams, TickReport};
use super::gateway::{TelephonyEvent, TelephonyGateway};
use super::lifecycle::{CallLifecycle, LifecycleEffect};
use crate::agent::ReadinessValidator;
use crate::callback::{CallbackInjector, InjectionReport};
use crate::config::CallCenterConfig;
use crate::database::{
    AgentStatus, DatabaseManager, DbAgent, DbCallback, DbHoldingEntry, DbMissedContact, DbQueueEntry,
    DbReconciliationRun, NewCallback, SqlEligibilitySource,
};
use crate::error::{CallCenterError, Result};
use crate::monitoring::{CallCenterStats, StatsCollector};
use crate::queue::{EnqueueResult, HoldingQueue, InboundCall, QueueReconciler, ReconcileParams, ReconciliationReport};
use crate::routing::{EligibilityRules, EligibilitySource, PriorityScorer};

/// Result of one heartbeat sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired_agents: Vec<String>,
}

/// Result of one retention pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub purged_holding_entries: u64,
}

/// Agent registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub display_name: String,
    #[serde(default)]
    pub max_concurrent_calls: Option<u32>,
}

/// A callback with every queue entry it has produced
#[derive(Debug, Clone, Serialize)]
pub struct CallbackDetail {
    pub callback: DbCallback,
    pub entries: Vec<DbQueueEntry>,
}

/// Call routing engine
///
/// Owns one instance of every component, wired to a shared database and
/// telephony gateway. All state lives in the store, so the engine itself is
/// cheap to share behind an `Arc` and every operation may run concurrently with
/// any other, including itself.
pub struct CallCenterEngine {
    config: CallCenterConfig,
    db: DatabaseManager,
    readiness: Arc<ReadinessValidator>,
    holding: Arc<HoldingQueue>,
    reconciler: QueueReconciler,
    lifecycle: Arc<CallLifecycle>,
    orchestrator: AssignmentOrchestrator,
    injector: CallbackInjector,
    stats: StatsCollector,
}

impl CallCenterEngine {
    /// Connect to the configured database and build the engine
    pub async fn new(config: CallCenterConfig, gateway: Arc<dyn TelephonyGateway>) -> Result<Arc<Self>> {
        config.validate().map_err(CallCenterError::configuration)?;
        let db = DatabaseManager::with_config(&config.database).await?;
        Ok(Self::with_database(config, db, gateway))
    }

    /// Build on an existing database, reading eligibility from its own tables
    pub fn with_database(config: CallCenterConfig, db: DatabaseManager, gateway: Arc<dyn TelephonyGateway>) -> Arc<Self> {
        let source = Arc::new(SqlEligibilitySource::new(db.clone()));
        Self::with_source(config, db, source, gateway)
    }

    /// Build with an external eligibility source
    pub fn with_source(
        config: CallCenterConfig,
        db: DatabaseManager,
        source: Arc<dyn EligibilitySource>,
        gateway: Arc<dyn TelephonyGateway>,
    ) -> Arc<Self> {
        info!("🚀 Creating CallCenterEngine '{}'", config.general.instance_name);

        let readiness = Arc::new(ReadinessValidator::new(db.clone(), config.agents.clone()));
        let holding = Arc::new(HoldingQueue::new(db.clone(), readiness.clone(), config.queues.clone()));

        let rules = EligibilityRules::from_config(&config.reconciler);
        let scorer = PriorityScorer::new(config.scoring.clone(), rules);
        let reconciler = QueueReconciler::new(db.clone(), source, scorer, config.reconciler.clone());

        let lifecycle = Arc::new(CallLifecycle::new(
            db.clone(),
            holding.clone(),
            readiness.clone(),
            config.scoring.outcomes.clone(),
            config.orchestrator.clone(),
        ));
        let orchestrator = AssignmentOrchestrator::new(
            db.clone(),
            holding.clone(),
            readiness.clone(),
            lifecycle.clone(),
            gateway,
            config.orchestrator.clone(),
        );
        let injector = CallbackInjector::new(db.clone(), readiness.clone(), config.callbacks.clone());
        let stats = StatsCollector::new(db.clone(), &config.database);

        Arc::new(Self {
            config,
            db,
            readiness,
            holding,
            reconciler,
            lifecycle,
            orchestrator,
            injector,
            stats,
        })
    }

    pub fn config(&self) -> &CallCenterConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    pub fn readiness(&self) -> &Arc<ReadinessValidator> {
        &self.readiness
    }

    pub fn holding_queue(&self) -> &Arc<HoldingQueue> {
        &self.holding
    }

    // === Periodic operations ===

    pub async fn reconcile(&self, params: ReconcileParams) -> Result<ReconciliationReport> {
        self.reconciler.run(params).await
    }

    pub async fn tick(&self, params: TickParams) -> Result<TickReport> {
        self.orchestrator.tick(params).await
    }

    pub async fn inject_callbacks(&self) -> Result<InjectionReport> {
        self.injector.tick(Utc::now()).await
    }

    pub async fn sweep_heartbeats(&self) -> Result<SweepReport> {
        let expired_agents = self.readiness.sweep_expired().await?;
        Ok(SweepReport { expired_agents })
    }

    pub async fn purge_terminal(&self) -> Result<RetentionReport> {
        let retention = chrono::Duration::hours(self.config.queues.terminal_retention_hours as i64);
        let purged_holding_entries = self.holding.purge_terminal(retention).await?;
        Ok(RetentionReport { purged_holding_entries })
    }

    // === Inbound calls ===

    pub async fn enqueue_inbound(&self, call: InboundCall) -> Result<EnqueueResult> {
        self.holding.enqueue(call).await
    }

    /// A holding entry with its position recomputed first
    pub async fn holding_entry(&self, call_id: &str) -> Result<DbHoldingEntry> {
        self.holding.refresh_position(call_id).await
    }

    pub async fn waiting_calls(&self) -> Result<Vec<DbHoldingEntry>> {
        self.holding.waiting().await
    }

    pub async fn handle_event(&self, event: TelephonyEvent) -> Result<LifecycleEffect> {
        let call = event.call().clone();
        let effect = self.lifecycle.handle_event(event).await?;
        debug!("Event for {} → {:?}", call, effect);
        Ok(effect)
    }

    pub async fn missed_contacts(&self, since: DateTime<Utc>, limit: u32) -> Result<Vec<DbMissedContact>> {
        self.db.list_missed_contacts(since, limit).await
    }

    // === Agents ===

    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<DbAgent> {
        self.readiness
            .register_agent(
                &registration.agent_id,
                &registration.display_name,
                registration.max_concurrent_calls,
            )
            .await?;
        info!("👤 Registered agent {}", registration.agent_id);
        self.agent(&registration.agent_id).await
    }

    pub async fn agent(&self, agent_id: &str) -> Result<DbAgent> {
        self.db
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| CallCenterError::not_found(format!("agent {}", agent_id)))
    }

    pub async fn list_agents(&self) -> Result<Vec<DbAgent>> {
        self.db.list_agents().await
    }

    pub async fn login_agent(&self, agent_id: &str, session_id: &str, device_connected: bool) -> Result<()> {
        self.readiness.login(agent_id, session_id, device_connected).await
    }

    pub async fn logout_agent(&self, agent_id: &str) -> Result<bool> {
        self.readiness.logout(agent_id).await
    }

    pub async fn agent_heartbeat(&self, agent_id: &str, device_connected: Option<bool>) -> Result<()> {
        self.readiness.record_heartbeat(agent_id, device_connected).await
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<()> {
        self.readiness.set_status(agent_id, status).await
    }

    /// Enable or disable an agent. A disabled agent is never ready and cannot log in.
    pub async fn set_agent_active(&self, agent_id: &str, active: bool) -> Result<()> {
        let applied = self.db.set_agent_active(agent_id, active).await?;
        self.readiness.cache().invalidate(agent_id);
        if !applied {
            return Err(CallCenterError::not_found(format!("agent {}", agent_id)));
        }
        info!("👤 Agent {} active = {}", agent_id, active);
        Ok(())
    }

    // === Callbacks ===

    pub async fn schedule_callback(&self, request: NewCallback) -> Result<DbCallback> {
        self.injector.schedule(request).await
    }

    pub async fn accept_callback(&self, callback_id: &str, agent_id: &str) -> Result<DbCallback> {
        self.injector.accept(callback_id, agent_id).await
    }

    pub async fn complete_callback(&self, callback_id: &str) -> Result<()> {
        self.injector.complete(callback_id).await
    }

    pub async fn callback(&self, callback_id: &str) -> Result<CallbackDetail> {
        let callback = self
            .db
            .get_callback(callback_id)
            .await?
            .ok_or_else(|| CallCenterError::not_found(format!("callback {}", callback_id)))?;
        let entries = self.db.entries_for_callback(callback_id).await?;
        Ok(CallbackDetail { callback, entries })
    }

    // === Monitoring ===

    pub async fn statistics(&self) -> Result<CallCenterStats> {
        self.stats
            .collect(&self.config.general.instance_name, &self.readiness)
            .await
    }

    pub async fn reconciliation_runs(&self, limit: u32) -> Result<Vec<DbReconciliationRun>> {
        self.db.recent_reconciliation_runs(limit).await
    }
}
