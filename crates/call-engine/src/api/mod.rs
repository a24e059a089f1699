//! # Operational HTTP API
//!
//! Exposes the engine's idempotent "run now" triggers alongside the endpoints
//! the telephony side and agent desktops call: inbound arrivals, lifecycle
//! events, logins and heartbeats, and callback scheduling.
//!
//! | Method | Path                                   | Operation                  |
//! |--------|----------------------------------------|----------------------------|
//! | GET    | `/api/v1/health`                       | store connectivity         |
//! | POST   | `/api/v1/reconcile`                    | reconcile now              |
//! | GET    | `/api/v1/reconcile/runs`               | recent run history         |
//! | POST   | `/api/v1/tick`                         | assignment tick now        |
//! | POST   | `/api/v1/callbacks/inject`             | inject callbacks now       |
//! | POST   | `/api/v1/callbacks`                    | schedule a callback        |
//! | GET    | `/api/v1/callbacks/:id`                | callback and its entries   |
//! | POST   | `/api/v1/callbacks/:id/accept`         | accept for an agent        |
//! | POST   | `/api/v1/callbacks/:id/complete`       | mark done                  |
//! | POST   | `/api/v1/agents/sweep`                 | heartbeat sweep now        |
//! | POST   | `/api/v1/agents`                       | register an agent          |
//! | POST   | `/api/v1/agents/:id/heartbeat`         | heartbeat                  |
//! | POST   | `/api/v1/inbound`                      | inbound arrival            |
//! | POST   | `/api/v1/events`                       | telephony lifecycle event  |
//! | GET    | `/api/v1/stats`                        | statistics snapshot        |
//!
//! Errors come back as `{"error": <kind>, "message": <text>}` with a status
//! derived from the [`CallCenterError`](crate::error::CallCenterError) variant.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;

use crate::orchestrator::CallCenterEngine;

pub use error::{ApiError, ApiResult, ErrorBody};

/// Build the `/api/v1` router over a shared engine
pub fn router(engine: Arc<CallCenterEngine>) -> Router {
    let v1 = Router::new()
        .route("/health", get(handlers::health))
        .route("/reconcile", post(handlers::reconcile))
        .route("/reconcile/runs", get(handlers::reconciliation_runs))
        .route("/tick", post(handlers::tick))
        .route("/retention/purge", post(handlers::purge_terminal))
        .route("/callbacks/inject", post(handlers::inject_callbacks))
        .route("/callbacks", post(handlers::schedule_callback))
        .route("/callbacks/:callback_id", get(handlers::get_callback))
        .route("/callbacks/:callback_id/accept", post(handlers::accept_callback))
        .route("/callbacks/:callback_id/complete", post(handlers::complete_callback))
        .route("/agents/sweep", post(handlers::sweep_heartbeats))
        .route("/agents", get(handlers::list_agents).post(handlers::register_agent))
        .route("/agents/:agent_id", get(handlers::get_agent))
        .route("/agents/:agent_id/login", post(handlers::login_agent))
        .route("/agents/:agent_id/logout", post(handlers::logout_agent))
        .route("/agents/:agent_id/heartbeat", post(handlers::heartbeat))
        .route("/agents/:agent_id/status", put(handlers::set_agent_status))
        .route("/agents/:agent_id/active", put(handlers::set_agent_active))
        .route("/inbound", post(handlers::enqueue_inbound))
        .route("/inbound/waiting", get(handlers::waiting_calls))
        .route("/inbound/:call_id", get(handlers::holding_entry))
        .route("/events", post(handlers::telephony_event))
        .route("/missed", get(handlers::missed_contacts))
        .route("/stats", get(handlers::stats))
        .with_state(engine);

    Router::new().nest("/api/v1", v1)
}
