//! # dialq Call Engine
//!
//! Call routing and queue engine for a call-center workload. It decides who
//! should be called and how urgently, keeps the outbound queue in step with the
//! record system, holds inbound callers in a fair order, and pairs calls with
//! agents that are provably ready to take them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌───────────────────────────┐
//! │ Eligibility  │──►│ classify + score │──►│ QueueReconciler           │
//! │ source       │   │ (routing)        │   │ queue_state/queue_entries │
//! └──────────────┘   └──────────────────┘   └─────────────┬─────────────┘
//!                                                         │ outbound
//! inbound ──► HoldingQueue ───────────────────────────────┤
//!                                                         ▼
//! CallbackInjector ──► override entries ──►  AssignmentOrchestrator ──► TelephonyGateway
//!                                                         ▲                     │
//!            ReadinessValidator (heartbeat, device, status)                     │
//!                                                                               ▼
//!                                    CallLifecycle ◄────────────── TelephonyEvent
//! ```
//!
//! The SQLite store is the single source of truth. Every transition that
//! matters for correctness is a conditional write or a transaction, so any of
//! the periodic workers may run concurrently or redundantly.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dialq_call_engine::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let engine = CallCenterEngine::new(CallCenterConfig::default(), Arc::new(LoggingGateway::new())).await?;
//!
//! engine.enqueue_inbound(InboundCall {
//!     call_id: "call-1".to_string(),
//!     caller_number: Some("+15550100".to_string()),
//!     priority: None,
//! }).await?;
//!
//! let report = engine.tick(TickParams::default()).await?;
//! println!("assigned {} inbound call(s)", report.inbound_assigned);
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod agent;
pub mod api;
pub mod callback;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod server;

pub use config::CallCenterConfig;
pub use error::{CallCenterError, Result};
pub use orchestrator::CallCenterEngine;
pub use server::{CallCenterServer, CallCenterServerBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{CallCenterConfig, CallCenterEngine, CallCenterError, CallCenterServer, CallCenterServerBuilder, Result};

    pub use crate::config::{
        AgentConfig, CallbackConfig, DatabaseConfig, OrchestratorConfig, QueueConfig, ReconcilerConfig, ScoringConfig,
    };

    pub use crate::agent::{ReadinessCheck, ReadinessValidator};
    pub use crate::callback::InjectionReport;
    pub use crate::database::{AgentStatus, DatabaseManager, NewCallback};
    pub use crate::monitoring::CallCenterStats;
    pub use crate::orchestrator::{
        AgentRegistration, CallRef, LifecycleEffect, LoggingGateway, TelephonyEvent, TelephonyGateway, TickParams,
        TickReport,
    };
    pub use crate::queue::{EnqueueResult, InboundCall, ReconcileParams, ReconciliationReport};
    pub use crate::routing::{CallOutcome, CallSubject, EligibilitySource, QueueCategory};
    pub use crate::server::ScheduledTask;

    pub use chrono::{DateTime, Utc};
}
