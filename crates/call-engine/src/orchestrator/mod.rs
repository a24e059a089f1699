//! # Call Center Orchestration Module
//!
//! Pairs waiting work with ready agents and follows each pairing to its end.
//!
//! ## Module Organization
//!
//! - **[`core`]**: [`CallCenterEngine`], which owns every component and is what the
//!   server, HTTP surface and CLI drive
//! - **[`assignment`]**: the polling tick that binds calls to agents
//! - **[`lifecycle`]**: applies telephony events to calls, agents and subjects
//! - **[`gateway`]**: the telephony boundary
//!
//! ## Assignment Flow
//!
//! ```text
//!  holding queue head ──┐                 ┌── ranked ready agents
//!  (else outbound head) │                 │   (tier, score, load, idle)
//!                       ▼                 ▼
//!              ┌─────────────────────────────────┐
//!              │ tx: bind call ─► reserve slot   │  rollback + next agent
//!              └───────────────┬─────────────────┘  on a lost slot
//!                              ▼
//!                  TelephonyGateway::ring_agent
//!                              │
//!                              ▼ (later)
//!          TelephonyEvent ─► CallLifecycle::handle_event
//! ```
//!
//! A call is claimed with a conditional `UPDATE` before any agent is looked at,
//! so two ticks racing for the same caller cannot both win. An agent slot is
//! reserved inside the same transaction that binds the call, so a failed
//! reservation never leaves a call bound to nobody.

pub mod assignment;
pub mod core;
pub mod gateway;
pub mod lifecycle;

pub use assignment::{Assignment, AssignmentOrchestrator, TickParams, TickReport};
pub use core::{AgentRegistration, CallCenterEngine, CallbackDetail, RetentionReport, SweepReport};
pub use gateway::{CallRef, LoggingGateway, RecordingGateway, TelephonyEvent, TelephonyGateway};
pub use lifecycle::{CallLifecycle, LifecycleEffect};
