//! # Call Center Server
//!
//! Runs the engine's periodic workers, pumps telephony events into the
//! lifecycle handler and serves the HTTP API.
//!
//! ```text
//!                 ┌────────────────────────── CallCenterServer ──────────────────────────┐
//!                 │                                                                       │
//!  interval ──►   │  reconcile   tick   callbacks   heartbeat sweep   retention purge    │
//!                 │      └─────────┴────────┴──────────────┴──────────────┘               │
//!                 │                         ▼                                             │
//!                 │                 Arc<CallCenterEngine> ◄── event pump ◄── mpsc ◄─ gateway
//!                 │                         ▲                                             │
//!  HTTP ──────►   │                 axum /api/v1 router                                   │
//!                 └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every worker is a [`ScheduledTask`] whose `run_once` is idempotent: running
//! it twice, or on two servers against one database, is safe. The same
//! operations are reachable directly through the engine, the API and the CLI.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::CallCenterConfig;
use crate::error::{CallCenterError, Result};
use crate::orchestrator::{CallCenterEngine, LoggingGateway, TelephonyEvent, TelephonyGateway, TickParams};
use crate::queue::ReconcileParams;

/// A periodic worker
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One pass. Must be safe to run concurrently with itself.
    async fn run_once(&self) -> Result<()>;
}

/// Reconciler worker. Carries the resume offset between runs so a large
/// subject table is walked across several budgeted passes.
pub struct ReconcileTask {
    engine: Arc<CallCenterEngine>,
    offset: AtomicU64,
}

impl ReconcileTask {
    pub fn new(engine: Arc<CallCenterEngine>) -> Self {
        Self {
            engine,
            offset: AtomicU64::new(0),
        }
    }

    /// Offset the next pass starts from
    pub fn next_offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduledTask for ReconcileTask {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.config().reconciler.interval_secs)
    }

    async fn run_once(&self) -> Result<()> {
        let params = ReconcileParams {
            offset: self.next_offset(),
            ..Default::default()
        };
        let report = self.engine.reconcile(params).await?;
        let next = if report.has_more() { report.next_offset } else { 0 };
        self.offset.store(next, Ordering::SeqCst);
        Ok(())
    }
}

pub struct AssignmentTickTask {
    engine: Arc<CallCenterEngine>,
}

impl AssignmentTickTask {
    pub fn new(engine: Arc<CallCenterEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for AssignmentTickTask {
    fn name(&self) -> &'static str {
        "assignment_tick"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.config().orchestrator.tick_interval_secs)
    }

    async fn run_once(&self) -> Result<()> {
        let report = self.engine.tick(TickParams::default()).await?;
        if report.no_agent_available {
            debug!("Tick ended with work left and no ready agent");
        }
        Ok(())
    }
}

pub struct CallbackInjectionTask {
    engine: Arc<CallCenterEngine>,
}

impl CallbackInjectionTask {
    pub fn new(engine: Arc<CallCenterEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for CallbackInjectionTask {
    fn name(&self) -> &'static str {
        "callback_injection"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.config().callbacks.interval_secs)
    }

    async fn run_once(&self) -> Result<()> {
        let report = self.engine.inject_callbacks().await?;
        if report.errors > 0 {
            warn!("⚠️ {} callback(s) failed to inject", report.errors);
        }
        Ok(())
    }
}

pub struct HeartbeatSweepTask {
    engine: Arc<CallCenterEngine>,
}

impl HeartbeatSweepTask {
    pub fn new(engine: Arc<CallCenterEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for HeartbeatSweepTask {
    fn name(&self) -> &'static str {
        "heartbeat_sweep"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.config().agents.sweep_interval_secs)
    }

    async fn run_once(&self) -> Result<()> {
        self.engine.sweep_heartbeats().await?;
        Ok(())
    }
}

pub struct RetentionTask {
    engine: Arc<CallCenterEngine>,
}

impl RetentionTask {
    pub fn new(engine: Arc<CallCenterEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ScheduledTask for RetentionTask {
    fn name(&self) -> &'static str {
        "retention"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.engine.config().queues.retention_interval_secs)
    }

    async fn run_once(&self) -> Result<()> {
        let report = self.engine.purge_terminal().await?;
        if report.purged_holding_entries > 0 {
            info!("🧹 Purged {} terminal holding entries", report.purged_holding_entries);
        }
        Ok(())
    }
}

/// The standard worker set
pub fn default_tasks(engine: &Arc<CallCenterEngine>) -> Vec<Arc<dyn ScheduledTask>> {
    vec![
        Arc::new(ReconcileTask::new(engine.clone())),
        Arc::new(AssignmentTickTask::new(engine.clone())),
        Arc::new(CallbackInjectionTask::new(engine.clone())),
        Arc::new(HeartbeatSweepTask::new(engine.clone())),
        Arc::new(RetentionTask::new(engine.clone())),
    ]
}

/// Run `task` on its interval until the handle is aborted. A failed pass is
/// logged and the loop carries on.
fn spawn_task(task: Arc<dyn ScheduledTask>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = task.interval().max(Duration::from_millis(100));
        info!("⏱️ Starting worker '{}' every {:?}", task.name(), period);

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = task.run_once().await {
                error!("Worker '{}' pass failed: {}", task.name(), e);
            }
        }
    })
}

/// Feed gateway events into the lifecycle handler until every sender is gone
fn spawn_event_pump(engine: Arc<CallCenterEngine>, mut events: mpsc::UnboundedReceiver<TelephonyEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let call = event.call().clone();
            if let Err(e) = engine.handle_event(event).await {
                warn!("⚠️ Event for {} not applied: {}", call, e);
            }
        }
        debug!("Telephony event channel closed");
    })
}

/// Engine plus its background workers and HTTP listener
pub struct CallCenterServer {
    engine: Arc<CallCenterEngine>,
    tasks: Vec<Arc<dyn ScheduledTask>>,
    events: Option<mpsc::UnboundedReceiver<TelephonyEvent>>,
    worker_handles: Vec<JoinHandle<()>>,
    event_handle: Option<JoinHandle<()>>,
    api_handle: Option<JoinHandle<()>>,
    api_addr: Option<SocketAddr>,
}

impl CallCenterServer {
    pub fn new(engine: Arc<CallCenterEngine>, events: Option<mpsc::UnboundedReceiver<TelephonyEvent>>) -> Self {
        let tasks = default_tasks(&engine);
        Self {
            engine,
            tasks,
            events,
            worker_handles: Vec::new(),
            event_handle: None,
            api_handle: None,
            api_addr: None,
        }
    }

    pub fn engine(&self) -> &Arc<CallCenterEngine> {
        &self.engine
    }

    pub fn tasks(&self) -> &[Arc<dyn ScheduledTask>] {
        &self.tasks
    }

    /// Address the API is listening on, once started
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn is_running(&self) -> bool {
        !self.worker_handles.is_empty() || self.event_handle.is_some() || self.api_handle.is_some()
    }

    /// Start workers, the event pump and the API listener, as configured
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(CallCenterError::orchestration("server already started"));
        }
        let config = self.engine.config().clone();

        if config.general.enable_workers {
            for task in &self.tasks {
                self.worker_handles.push(spawn_task(task.clone()));
            }
            info!("✅ Started {} worker(s)", self.worker_handles.len());
        }

        if let Some(events) = self.events.take() {
            self.event_handle = Some(spawn_event_pump(self.engine.clone(), events));
        }

        if config.api.enabled {
            let listener = tokio::net::TcpListener::bind(config.api.bind_addr)
                .await
                .map_err(|e| CallCenterError::configuration(format!("cannot bind {}: {}", config.api.bind_addr, e)))?;
            let addr = listener
                .local_addr()
                .map_err(|e| CallCenterError::internal(e.to_string()))?;
            let app = crate::api::router(self.engine.clone());
            self.api_handle = Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!("❌ API server stopped: {}", e);
                }
            }));
            self.api_addr = Some(addr);
            info!("🌐 API listening on http://{}/api/v1", addr);
        }

        info!("✅ Call center server '{}' started", config.general.instance_name);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping call center server...");
        for handle in self.worker_handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        for handle in [self.event_handle.take(), self.api_handle.take()].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        self.api_addr = None;
        info!("✅ Call center server stopped");
        Ok(())
    }

    /// Start, wait for Ctrl+C, stop
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        info!("📞 Call center server is running; press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| CallCenterError::internal(format!("signal handler: {}", e)))?;
        self.stop().await
    }
}

/// Builder for [`CallCenterServer`]
pub struct CallCenterServerBuilder {
    config: Option<CallCenterConfig>,
    database_url: Option<String>,
    gateway: Option<(Arc<dyn TelephonyGateway>, Option<mpsc::UnboundedReceiver<TelephonyEvent>>)>,
}

impl CallCenterServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            database_url: None,
            gateway: None,
        }
    }

    pub fn with_config(mut self, config: CallCenterConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_in_memory_database(self) -> Self {
        self.with_database_url("sqlite::memory:")
    }

    /// Use a custom gateway; `events` carries what it reports back
    pub fn with_gateway(
        mut self,
        gateway: Arc<dyn TelephonyGateway>,
        events: Option<mpsc::UnboundedReceiver<TelephonyEvent>>,
    ) -> Self {
        self.gateway = Some((gateway, events));
        self
    }

    /// Build the engine and server. Without a custom gateway, ring requests are
    /// logged and echoed back as `CallRinging` events.
    pub async fn build(self) -> Result<CallCenterServer> {
        let mut config = self.config.unwrap_or_default();
        if let Some(url) = self.database_url {
            config.database.url = url;
        }

        let (gateway, events) = match self.gateway {
            Some(pair) => pair,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Arc::new(LoggingGateway::with_events(tx)) as Arc<dyn TelephonyGateway>, Some(rx))
            }
        };

        let engine = CallCenterEngine::new(config, gateway).await?;
        Ok(CallCenterServer::new(engine, events))
    }
}

impl Default for CallCenterServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InboundCall;

    fn quiet_config() -> CallCenterConfig {
        let mut config = CallCenterConfig::default();
        config.api.enabled = false;
        config.general.enable_workers = false;
        config
    }

    #[tokio::test]
    async fn test_builder_defaults_to_logging_gateway() {
        let mut server = CallCenterServerBuilder::new()
            .with_config(quiet_config())
            .with_in_memory_database()
            .build()
            .await
            .unwrap();

        assert_eq!(server.tasks().len(), 5);
        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.start().await.is_err());
        server.stop().await.unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_workers_assign_waiting_call() {
        let mut config = quiet_config();
        config.general.enable_workers = true;
        config.orchestrator.tick_interval_secs = 0;

        let mut server = CallCenterServerBuilder::new()
            .with_config(config)
            .with_in_memory_database()
            .build()
            .await
            .unwrap();
        let engine = server.engine().clone();
        engine.readiness().register_agent("alice", "Alice", None).await.unwrap();
        engine.login_agent("alice", "s-1", true).await.unwrap();
        engine
            .enqueue_inbound(InboundCall {
                call_id: "call-1".to_string(),
                caller_number: None,
                priority: None,
            })
            .await
            .unwrap();

        server.start().await.unwrap();
        let mut assigned = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let entry = engine.holding_queue().get("call-1").await.unwrap();
            if entry.assigned_agent_id.as_deref() == Some("alice") {
                assigned = true;
                break;
            }
        }
        server.stop().await.unwrap();
        assert!(assigned);
    }

    #[tokio::test]
    async fn test_reconcile_task_resets_offset_after_full_pass() {
        let db = crate::database::DatabaseManager::new_in_memory().await.unwrap();
        let engine = CallCenterEngine::with_database(quiet_config(), db, Arc::new(LoggingGateway::new()));
        let task = ReconcileTask::new(engine);
        task.run_once().await.unwrap();
        assert_eq!(task.next_offset(), 0);
    }
}
