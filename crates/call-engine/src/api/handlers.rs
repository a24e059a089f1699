//! Route handlers. Each one is a thin adapter over a [`CallCenterEngine`]
//! operation; all of them are safe to call repeatedly.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::ApiResult;
use crate::database::{AgentStatus, NewCallback};
use crate::orchestrator::{AgentRegistration, CallCenterEngine, TelephonyEvent, TickParams};
use crate::queue::{InboundCall, ReconcileParams};

type Engine = State<Arc<CallCenterEngine>>;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub instance: String,
}

pub async fn health(State(engine): Engine) -> ApiResult<Json<Health>> {
    engine.database().health_check().await?;
    Ok(Json(Health {
        status: "ok",
        instance: engine.config().general.instance_name.clone(),
    }))
}

// === Triggers ===

/// POST /reconcile - one budgeted reconciliation pass; the report carries the
/// offset to resume from
pub async fn reconcile(State(engine): Engine, body: Option<Json<ReconcileParams>>) -> ApiResult<impl IntoResponse> {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    Ok(Json(engine.reconcile(params).await?))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn reconciliation_runs(State(engine): Engine, Query(q): Query<LimitQuery>) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.reconciliation_runs(q.limit).await?))
}

pub async fn tick(State(engine): Engine, body: Option<Json<TickParams>>) -> ApiResult<impl IntoResponse> {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    Ok(Json(engine.tick(params).await?))
}

pub async fn inject_callbacks(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.inject_callbacks().await?))
}

pub async fn sweep_heartbeats(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.sweep_heartbeats().await?))
}

pub async fn purge_terminal(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.purge_terminal().await?))
}

// === Inbound ===

pub async fn enqueue_inbound(State(engine): Engine, Json(call): Json<InboundCall>) -> ApiResult<impl IntoResponse> {
    let result = engine.enqueue_inbound(call).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn waiting_calls(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.waiting_calls().await?))
}

pub async fn holding_entry(State(engine): Engine, Path(call_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.holding_entry(&call_id).await?))
}

pub async fn telephony_event(State(engine): Engine, Json(event): Json<TelephonyEvent>) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.handle_event(event).await?))
}

#[derive(Debug, Deserialize)]
pub struct MissedQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
    #[serde(default = "default_missed_limit")]
    pub limit: u32,
}

fn default_hours() -> i64 {
    24
}

fn default_missed_limit() -> u32 {
    100
}

pub async fn missed_contacts(State(engine): Engine, Query(q): Query<MissedQuery>) -> ApiResult<impl IntoResponse> {
    let since = Utc::now() - Duration::hours(q.hours.max(0));
    Ok(Json(engine.missed_contacts(since, q.limit).await?))
}

// === Agents ===

pub async fn register_agent(
    State(engine): Engine,
    Json(registration): Json<AgentRegistration>,
) -> ApiResult<impl IntoResponse> {
    let agent = engine.register_agent(registration).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn list_agents(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.list_agents().await?))
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: crate::database::DbAgent,
    pub readiness: crate::agent::ReadinessCheck,
}

pub async fn get_agent(State(engine): Engine, Path(agent_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let agent = engine.agent(&agent_id).await?;
    let readiness = engine.readiness().is_ready(&agent_id).await?;
    Ok(Json(AgentView { agent, readiness }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub session_id: String,
    #[serde(default = "default_true")]
    pub device_connected: bool,
}

fn default_true() -> bool {
    true
}

pub async fn login_agent(
    State(engine): Engine,
    Path(agent_id): Path<String>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    engine.login_agent(&agent_id, &req.session_id, req.device_connected).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub logged_out: bool,
}

pub async fn logout_agent(State(engine): Engine, Path(agent_id): Path<String>) -> ApiResult<impl IntoResponse> {
    let logged_out = engine.logout_agent(&agent_id).await?;
    Ok(Json(LogoutResponse { logged_out }))
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub device_connected: Option<bool>,
}

pub async fn heartbeat(
    State(engine): Engine,
    Path(agent_id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    engine.agent_heartbeat(&agent_id, req.device_connected).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AgentStatus,
}

pub async fn set_agent_status(
    State(engine): Engine,
    Path(agent_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<impl IntoResponse> {
    engine.set_agent_status(&agent_id, req.status).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

pub async fn set_agent_active(
    State(engine): Engine,
    Path(agent_id): Path<String>,
    Json(req): Json<ActiveRequest>,
) -> ApiResult<impl IntoResponse> {
    engine.set_agent_active(&agent_id, req.active).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Callbacks ===

pub async fn schedule_callback(State(engine): Engine, Json(req): Json<NewCallback>) -> ApiResult<impl IntoResponse> {
    let callback = engine.schedule_callback(req).await?;
    Ok((StatusCode::CREATED, Json(callback)))
}

pub async fn get_callback(State(engine): Engine, Path(callback_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.callback(&callback_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AcceptRequest {
    pub agent_id: String,
}

pub async fn accept_callback(
    State(engine): Engine,
    Path(callback_id): Path<String>,
    Json(req): Json<AcceptRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.accept_callback(&callback_id, &req.agent_id).await?))
}

pub async fn complete_callback(State(engine): Engine, Path(callback_id): Path<String>) -> ApiResult<impl IntoResponse> {
    engine.complete_callback(&callback_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Monitoring ===

pub async fn stats(State(engine): Engine) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.statistics().await?))
}
